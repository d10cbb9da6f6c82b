pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod fault;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .try_init()
            .ok();
    }
}
