//! A comprehensive tooling suite for binary code disassembly and
//! patching.
//!
//! The suite splits in three layers:
//!
//! - [`ocelot_asm`] holds the representation and disassembly engine: the
//!   bit-level LR(0) parser, the instruction and operand model, the
//!   section-level disassembler and the reference resolver.
//! - [`ocelot_patch`] holds the modification planner: requests
//!   accumulate against the instruction model and a commit materialises
//!   them while preserving control-flow correctness.
//! - this crate ties both behind a [`Session`] handle: one per loaded
//!   file, owning the disassembled representation, a cursor for
//!   navigation, the modification API of the planner, deferred status
//!   retrieval and reproducible call tracing.
//!
//! # Example
//!
//! ```
//! use ocelot::{Session, StackPolicy};
//! use ocelot::image::{BinaryImage, FileType, SectionAttrs};
//! use ocelot::image::ArchCode;
//!
//! let mut image = BinaryImage::new("nop.bin", ArchCode::A64, FileType::Executable);
//! image.add_code_section(
//!     ".text",
//!     0x1000,
//!     vec![0x1F, 0x20, 0x03, 0xD5],
//!     SectionAttrs::STD_CODE,
//! );
//!
//! let mut session = Session::from_image(image);
//! session.disassemble().unwrap();
//! session.init_cursor(None, Some(0x1000), None).unwrap();
//! assert_eq!(session.get_insn_name().unwrap(), "hint");
//! ```
//!
//! [`ocelot_asm`]: ../ocelot_asm/index.html
//! [`ocelot_patch`]: ../ocelot_patch/index.html
//! [`Session`]: session/struct.Session.html

pub mod error;
pub mod session;
pub mod trace;

pub use error::{OcelotError, Status, Warning};
pub use session::Session;

pub use ocelot_patch::{CondId, GlobVarId, ModifId, ModifNext, ModifPos, StackPolicy};

/// Re-exports of the binary image contract, for building inputs.
pub mod image {
    pub use ocelot_asm::arch::ArchCode;
    pub use ocelot_asm::binary::{
        BinaryImage, DataEntry, FileType, Label, LabelKind, Section, SectionAttrs, SectionKind,
    };
}

/// Re-exports of the instruction model.
pub mod model {
    pub use ocelot_asm::arch::Comparison;
    pub use ocelot_asm::insn::{Annotations, Coding, Instruction};
    pub use ocelot_asm::operand::{Operand, Pointer, PointerKind, PointerTarget, Role};
}
