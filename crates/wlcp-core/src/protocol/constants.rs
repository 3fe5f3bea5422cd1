//! Register map and protocol constants for the wireless coprocessor.
//!
//! All addresses are in device space. The host bus can only map a bounded
//! set of windows onto this space at a time (see `partition`).

// ============================================================================
// Chip identification
// ============================================================================

/// Chip identity register.
pub const REG_CHIP_ID: u32 = 0x0030_5674;

/// Expected identity value for the supported silicon revision.
pub const CHIP_ID_SUPPORTED: u32 = 0x0404_1401;

// ============================================================================
// Device address space layout
// ============================================================================

/// Start of the firmware/download memory area.
pub const MEM_DOWNLOAD_BASE: u32 = 0x0000_0000;
/// Size of the memory window used during firmware download.
pub const MEM_DOWNLOAD_SIZE: u32 = 0x0001_6800;

/// Start of the working memory area used after boot.
pub const MEM_WORKING_BASE: u32 = 0x0002_8000;
/// Size of the working memory window.
pub const MEM_WORKING_SIZE: u32 = 0x0001_4000;

/// Start of the register file.
pub const REG_AREA_BASE: u32 = 0x0030_0000;
/// Size of the mapped register window.
pub const REG_AREA_SIZE: u32 = 0x0000_8800;

// ============================================================================
// Reset / boot control
// ============================================================================

/// Slave soft-reset register.
pub const REG_SOFT_RESET: u32 = 0x0030_0000;
/// Soft-reset request bit; the device clears it when the reset completes.
pub const SOFT_RESET_BIT: u32 = 0x0000_0001;
/// Poll budget for the reset-done indication.
pub const SOFT_RESET_MAX_POLLS: u32 = 10;

/// Embedded CPU control register.
pub const REG_ECPU_CONTROL: u32 = 0x0030_6310;
/// ORed into the control register to take the embedded CPU out of halt.
pub const ECPU_RUN_BIT: u32 = 0x0000_0001;

/// Interrupt status register (read does not clear).
pub const REG_INTERRUPT_NO_CLEAR: u32 = 0x0030_04F8;
/// Interrupt acknowledge register.
pub const REG_INTERRUPT_ACK: u32 = 0x0030_04F0;
/// Host-side interrupt mask register.
pub const REG_INTERRUPT_MASK: u32 = 0x0030_04FC;
/// Host-to-device interrupt trigger register.
pub const REG_INTERRUPT_TRIG: u32 = 0x0030_0474;

/// Firmware signalled init-complete.
pub const INTR_INIT_COMPLETE: u32 = 0x0000_0001;
/// Event record ready in mailbox slot A.
pub const INTR_EVENT_A: u32 = 0x0000_0002;
/// Event record ready in mailbox slot B.
pub const INTR_EVENT_B: u32 = 0x0000_0004;
/// Command mailbox processed.
pub const INTR_CMD_COMPLETE: u32 = 0x0000_0008;
/// Mask value that disables every device interrupt.
pub const INTR_ALL: u32 = 0xFFFF_FFFF;

/// Trigger value ringing the command-mailbox doorbell.
pub const INTR_TRIG_CMD: u32 = 0x0000_0001;

/// Poll budget for the firmware init-complete indication.
pub const INIT_COMPLETE_MAX_POLLS: u32 = 20;

// ============================================================================
// Mailbox pointers
// ============================================================================

/// Holds the device-space address of the command mailbox.
pub const REG_CMD_MAILBOX_PTR: u32 = 0x0030_0338;
/// Holds the device-space address of the first event mailbox slot.
pub const REG_EVENT_MAILBOX_PTR: u32 = 0x0030_033C;

/// Value written to [`REG_INTERRUPT_ACK`] after draining an event slot.
pub const EVENT_ACK: u32 = 0x0000_0200;

// ============================================================================
// Indirect top-level register access
// ============================================================================
//
// Top-level SoC registers are reached through an indirect protocol: write
// the target address, write a command code, poll the done bit, then read or
// write the data register.

/// Indirect access: target address register.
pub const REG_IND_ADDR: u32 = 0x0030_05F0;
/// Indirect access: data register.
pub const REG_IND_DATA: u32 = 0x0030_05F4;
/// Indirect access: control/status register.
pub const REG_IND_CTRL: u32 = 0x0030_05F8;

/// Indirect read command code.
pub const IND_CTRL_READ: u32 = 0x0000_0002;
/// Indirect write command code.
pub const IND_CTRL_WRITE: u32 = 0x0000_0001;
/// Set by the device when the indirect command has finished.
pub const IND_CTRL_DONE: u32 = 0x0000_0400;
/// Poll budget for one indirect command.
pub const IND_CTRL_MAX_POLLS: u32 = 10;

/// One entry of the post-boot top-register fixup table.
#[derive(Debug, Clone, Copy)]
pub struct TopRegFixup {
    /// Top-level register address.
    pub addr: u32,
    /// Bits cleared before applying `set`.
    pub mask: u32,
    /// Bits ORed into the register.
    pub set: u32,
}

/// Clock-source select in the top-level PLL control register.
pub const TOP_CLK_SELECT: TopRegFixup = TopRegFixup {
    addr: 0x0040_0402,
    mask: 0x0000_0003,
    set: 0x0000_0002,
};

/// IRQ output polarity (active low, level).
pub const TOP_IRQ_POLARITY: TopRegFixup = TopRegFixup {
    addr: 0x0040_0408,
    mask: 0x0000_0030,
    set: 0x0000_0010,
};

/// Post-boot register fixups, applied in order.
pub const TOP_REG_FIXUPS: &[TopRegFixup] = &[TOP_CLK_SELECT, TOP_IRQ_POLARITY];

// ============================================================================
// Sizes
// ============================================================================

/// Firmware image block size for download (bytes).
pub const FW_BLOCK_SIZE: usize = 512;

/// Machine word size; firmware images must be a multiple of this.
pub const WORD_SIZE: usize = 4;

/// Size of one event mailbox record.
pub const EVENT_RECORD_SIZE: usize = 64;

/// Maximum encoded command length accepted by the command mailbox.
pub const CMD_MAX_SIZE: usize = 512;

/// Number of data words one NVS burst record may carry.
pub const NVS_BURST_MAX_WORDS: usize = 31;

/// Number of security key slots in the device.
pub const KEY_SLOT_COUNT: usize = 4;

/// Number of traffic-class (AC) queues.
pub const AC_COUNT: usize = 4;
