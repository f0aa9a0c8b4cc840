//! Voxtutor Core Library
//!
//! 实时语音对话引擎：麦克风采集、与远端对话代理之间的双向实时通道、
//! 增量播放与打断，以及会话状态的统一管理。

pub mod audio;
pub mod channel;
pub mod orchestrator;
pub mod session;
pub mod telemetry;
