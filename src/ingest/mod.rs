pub mod hasher;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod status;
