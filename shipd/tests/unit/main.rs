//! Integration tests for shipd

mod mock;
mod test_pipeline;
mod test_server;
