//! Interrupt-bit allocation and to-host dispatch.
//!
//! The HAL delivers a single interrupt for all sixteen to-host bits; the
//! dispatcher installed here reads the pending set and calls the handler
//! registered for each bit. Unallocated bits fall through to a default
//! handler that clears the bit and logs it.

use std::sync::{Arc, Weak};

use mif_primitives::BitmapAllocator;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::MxError;
use crate::hal::{IRQ_BIT_COUNT, IrqTarget, MifHal};

/// Handler for one to-host bit. Runs in interrupt context and is expected to
/// clear its bit and signal a worker; nothing else.
pub type TohostHandler = Arc<dyn Fn(&IntrBits, u8) + Send + Sync>;

/// From-host bit reserved on every core for the host panic signal.
pub const PANIC_FROMHOST_BIT: u8 = 0;

struct Tables {
    tohost: BitmapAllocator,
    fromhost: [BitmapAllocator; 2],
    handlers: [Option<TohostHandler>; IRQ_BIT_COUNT as usize],
}

pub struct IntrBits {
    hal: Arc<dyn MifHal>,
    tables: Mutex<Tables>,
}

impl IntrBits {
    pub fn new(hal: Arc<dyn MifHal>) -> Arc<Self> {
        let mut fromhost = [BitmapAllocator::new(IRQ_BIT_COUNT as u32); 2];
        for bitmap in &mut fromhost {
            bitmap.reserve(PANIC_FROMHOST_BIT as u32);
        }
        Arc::new(Self {
            hal,
            tables: Mutex::new(Tables {
                tohost: BitmapAllocator::new(IRQ_BIT_COUNT as u32),
                fromhost,
                handlers: Default::default(),
            }),
        })
    }

    /// Mask every to-host bit and hook the dispatcher into the HAL.
    pub fn install(self: &Arc<Self>) {
        for bit in 0..IRQ_BIT_COUNT {
            self.hal.irq_bit_mask(bit);
        }
        let weak: Weak<IntrBits> = Arc::downgrade(self);
        self.hal.register_irq_handler(Arc::new(move || {
            if let Some(intr) = weak.upgrade() {
                intr.dispatch();
            }
        }));
    }

    pub fn uninstall(&self) {
        self.hal.unregister_irq_handler();
    }

    /// Run the handler of every pending to-host bit.
    pub fn dispatch(&self) {
        let pending = self.hal.irq_pending();
        for bit in 0..IRQ_BIT_COUNT {
            if pending & (1 << bit) == 0 {
                continue;
            }
            let handler = self.tables.lock().handlers[bit as usize].clone();
            match handler {
                Some(handler) => handler(self, bit),
                None => {
                    self.hal.irq_bit_clear(bit);
                    warn!(bit, "interrupt on unallocated to-host bit");
                }
            }
        }
    }

    /// Allocate a to-host bit, attach `handler` and unmask it.
    pub fn register_tohost(&self, handler: TohostHandler) -> Result<u8, MxError> {
        let bit = {
            let mut tables = self.tables.lock();
            let bit = tables
                .tohost
                .alloc()
                .map_err(|_| MxError::ResourceExhausted("to-host interrupt bits"))?
                as u8;
            tables.handlers[bit as usize] = Some(handler);
            bit
        };
        self.hal.irq_bit_clear(bit);
        self.hal.irq_bit_unmask(bit);
        trace!(bit, "registered to-host bit");
        Ok(bit)
    }

    pub fn unregister_tohost(&self, bit: u8) -> Result<(), MxError> {
        if bit >= IRQ_BIT_COUNT {
            return Err(MxError::NotFound);
        }
        self.hal.irq_bit_mask(bit);
        let mut tables = self.tables.lock();
        if tables.handlers[bit as usize].take().is_none() {
            return Err(MxError::NotFound);
        }
        tables.tohost.free(bit as u32);
        trace!(bit, "unregistered to-host bit");
        Ok(())
    }

    pub fn alloc_fromhost(&self, target: IrqTarget) -> Result<u8, MxError> {
        let mut tables = self.tables.lock();
        let bit = tables.fromhost[target.index()]
            .alloc()
            .map_err(|_| MxError::ResourceExhausted("from-host interrupt bits"))?;
        Ok(bit as u8)
    }

    pub fn free_fromhost(&self, bit: u8, target: IrqTarget) -> Result<(), MxError> {
        if bit == PANIC_FROMHOST_BIT || bit >= IRQ_BIT_COUNT {
            return Err(MxError::NotFound);
        }
        let mut tables = self.tables.lock();
        let bitmap = &mut tables.fromhost[target.index()];
        if !bitmap.is_set(bit as u32) {
            return Err(MxError::NotFound);
        }
        bitmap.free(bit as u32);
        Ok(())
    }

    /// Raise from-host `bit` on `target`.
    pub fn set(&self, bit: u8, target: IrqTarget) {
        self.hal.irq_bit_set(bit, target);
    }

    pub fn clear(&self, bit: u8) {
        self.hal.irq_bit_clear(bit);
    }

    pub fn mask(&self, bit: u8) {
        self.hal.irq_bit_mask(bit);
    }

    pub fn unmask(&self, bit: u8) {
        self.hal.irq_bit_unmask(bit);
    }

    /// Raise the reserved panic bit on every core.
    pub fn raise_panic(&self) {
        raise_panic(self.hal.as_ref());
    }

    pub fn tohost_in_use(&self) -> u32 {
        self.tables.lock().tohost.used_count()
    }

    pub fn fromhost_in_use(&self, target: IrqTarget) -> u32 {
        self.tables.lock().fromhost[target.index()].used_count()
    }
}

/// Raise the reserved panic bit on every core through the HAL alone.
pub(crate) fn raise_panic(hal: &dyn MifHal) {
    for target in IrqTarget::ALL {
        hal.irq_bit_set(PANIC_FROMHOST_BIT, target);
    }
}
