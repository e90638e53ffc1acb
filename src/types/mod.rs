//! Large-field data types
//!
//! The descriptor carried between a read and a write of a large value, and
//! the bounded buffer a read fills.

mod descriptor;
mod field_buffer;

pub use descriptor::Descriptor;
pub use field_buffer::FieldBuffer;
