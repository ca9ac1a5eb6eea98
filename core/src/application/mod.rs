//! Application layer - Use case services.
//!
//! The reconciler drives the tunnel registry from container state: it
//! depends only on the traits in `ports`, so the Docker, ssh and socket
//! implementations can be swapped for fakes in tests.

mod reconciler;

pub use reconciler::{Reconciler, ReconcilerState};
