//! Shaped I/O: a stream wrapper that paces reads and writes through a
//! [`Shaper`](bwshape_core::Shaper), and a TCP listener that hands out such streams.

mod listener;
pub use listener::{ListenerError, ShapedListener};

mod stats;
pub use stats::StreamStats;

mod stream;
pub use stream::{ShapedStream, MAX_CHUNK_SIZE};
