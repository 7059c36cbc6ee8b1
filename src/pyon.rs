//! PyON notation support.
//!
//! The compute agent answers protocol commands with a textual notation that
//! mirrors Python object literals: mappings with quoted keys, sequences,
//! quoted strings (single or double quotes), numbers in any of the usual
//! integer/float/scientific spellings, and the `True`/`False`/`None` literals
//! (the JSON spellings `true`/`false`/`null` are accepted as well).
//!
//! ```text
//! {"id": "00", "status": 'RUNNING', "progress": 1.5e1, "idle": False}
//! ```
//!
//! Decoding produces a generic [`Value`] tree. Nothing here knows about
//! slots or trajectories; mapping the tree onto domain types is the job of
//! [`crate::trajectory`].
//!
//! # Usage
//!
//! ```
//! use atomata::pyon::{decode, Value};
//!
//! let value = decode(r#"{"atoms": [["C", 0.0], ["O", 1.2e0]]}"#).unwrap();
//! assert!(matches!(value.get("atoms"), Some(Value::Sequence(_))));
//! ```

mod decode;
mod encode;
mod value;

pub use decode::{decode, SyntaxError, MAX_DEPTH};
pub use encode::encode;
pub use value::{Number, Value};
