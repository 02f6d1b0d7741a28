//! Board glue consumed by the supervisor.
//!
//! A [`MifHal`] owns the physical side of the shared-memory interface: the
//! mapping of shared RAM, the coprocessor reset line, the 16-bit interrupt
//! register pair and the mailbox file. Interrupt handlers are invoked from
//! whatever thread the implementation delivers interrupts on; they must not
//! block.

use std::io;
use std::sync::Arc;

use mif_primitives::Region;

/// Called on every interrupt raised towards the host.
pub type MifIrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Called when the coprocessor asks to be reset (it has panicked).
pub type ResetRequestHandler = Arc<dyn Fn() + Send + Sync>;

/// Number of interrupt bits per direction.
pub const IRQ_BIT_COUNT: u8 = 16;

/// Coprocessor core targeted by a from-host interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrqTarget {
    R4,
    M4,
}

impl IrqTarget {
    pub const ALL: [IrqTarget; 2] = [IrqTarget::R4, IrqTarget::M4];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            IrqTarget::R4 => 0,
            IrqTarget::M4 => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IrqTarget::R4 => "r4",
            IrqTarget::M4 => "m4",
        }
    }
}

pub trait MifHal: Send + Sync {
    /// Map shared RAM and return a view of it.
    fn map(&self) -> io::Result<Region>;
    fn unmap(&self);

    /// Assert (`true`) or release (`false`) the coprocessor reset line.
    fn reset(&self, assert: bool) -> io::Result<()>;

    /// To-host bits that are pending and not masked.
    fn irq_pending(&self) -> u16;
    fn irq_bit_clear(&self, bit: u8);
    fn irq_bit_mask(&self, bit: u8);
    fn irq_bit_unmask(&self, bit: u8);
    /// Raise a from-host bit on `target`.
    fn irq_bit_set(&self, bit: u8, target: IrqTarget);

    fn register_irq_handler(&self, handler: MifIrqHandler);
    fn unregister_irq_handler(&self);
    fn register_reset_request_handler(&self, handler: ResetRequestHandler);
    fn unregister_reset_request_handler(&self);

    fn mailbox_count(&self) -> u32;
    fn mailbox_read(&self, index: u32) -> u32;
    fn mailbox_write(&self, index: u32, value: u32);
}
