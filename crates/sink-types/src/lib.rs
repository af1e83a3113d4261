//! The closed value model, type lattice, identifier rules, and value codec
//! shared by every other crate in this workspace. See SPEC_FULL.md §4.1–4.3.

mod codec;
mod ident;
mod reference;
mod sink_type;
mod value;

pub use codec::{encode, encode_copy_field, normalize_json, Encoded, TypeConflict};
pub use ident::{make_hashed_name, quote_ident, sanitize_identifier};
pub use reference::extract_reference;
pub use sink_type::{compatible, infer, SinkType};
pub use value::{document_fields, stringify_id, Value};
