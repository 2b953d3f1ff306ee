#![doc(issue_tracker_base_url = "https://github.com/bwshape/bwshape/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use bwshape_core::*;
pub use bwshape_transport::*;
