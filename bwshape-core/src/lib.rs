//! The shaping engine: subnet matching, connection registration and the two-scope
//! (server and subnet) rate resolution.

mod error;
pub use error::{OptionsError, ShaperError};

mod options;
pub use options::{Limit, ShaperOptions};

mod peer;
pub use peer::PeerAddress;

mod registry;
pub use registry::{ConnectionId, SubnetLimit, SubnetMode, SubnetRegistry};

mod shaper;
pub use shaper::Shaper;

mod subnet;
pub use subnet::{IpAddrExt, Subnet};

pub use bwshape_bucket::{units, Direction, Limiter, Throttle, TokenBucket};
