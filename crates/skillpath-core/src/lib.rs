pub mod codec;
pub mod errors;
pub mod ids;
pub mod model;
pub mod payload;
pub mod stage;
