//! `apiflow` Core: typed values, the validation/coercion engine, typed collections,
//! and the `#tag` error taxonomy.

pub mod collection;
pub mod context;
pub mod error;
pub mod field;
pub mod object;
pub mod types;

pub use collection::{Collection, JoinMode, Keyed, SearchMode};
pub use context::{parse_body, RequestInput};
pub use error::{status_for_tag, ApiError, ErrorCode};
pub use field::{Check, Coerce, CoerceError, Field, TypedValue};
pub use object::{validate, validate_object, validated_fields, Declarations, Object, Schema};
pub use types::{Identity, Key, Value};
