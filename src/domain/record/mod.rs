//! Record domain - Entities, model descriptors, keys and the diff filter

mod entity;
mod filter;
mod key;
mod spec;

pub use entity::{
    from_flat, is_base_field, is_blank, now_millis, to_flat, Record, BASE_FIELDS, INTERNAL_MARK,
    RESERVED_FIELDS,
};
pub use filter::ModelFilter;
pub use key::{KeyMaker, RecordKey};
pub use spec::ModelSpec;
