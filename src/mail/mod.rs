pub mod decoders;
pub mod eml_store;
pub mod normalize;
pub mod sender;
pub mod store;
