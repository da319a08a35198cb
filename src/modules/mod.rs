pub mod codec;
pub mod gateway;
pub mod rtmp;
pub mod rtp;
pub mod sfu;
pub mod transcode;
