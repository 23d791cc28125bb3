pub mod collection;
pub mod mutation;
pub mod shape;
pub mod shape_stream;
