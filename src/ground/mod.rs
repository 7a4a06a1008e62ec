//! Ground-side half of the network: commanding, packet fan-out, and shell
//! reply reconstruction.

pub mod commander;
pub mod console;
pub mod discriminator;
pub mod reassembler;
pub mod sorter;

pub use commander::{Commander, CommanderError};
pub use discriminator::PacketDiscriminator;
pub use reassembler::{ReassembleError, ReplyReassembler, ShellReply};
pub use sorter::TelemetrySorter;
