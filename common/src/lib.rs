#![deny(warnings)]

mod error;
mod identity;
mod topology;

pub mod container;
pub mod sdr;
pub mod xclbin;

pub use error::{functions::*, FormatError, FormatErrorKind};
pub use identity::{parse_intel, parse_xilinx, Identity, IntelName, Vendor};
pub use topology::{MemBank, MemKind, Topology};
