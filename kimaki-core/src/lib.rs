pub mod config;
pub mod ipc;
pub mod thread;

pub use config::{KimakiConfig, load_config};
pub use ipc::{
    ActionButton, ActionButtonsPayload, ButtonColor, FileUploadPayload, IpcRequest,
    IpcRequestKind, IpcResponse, IpcStatus, NewIpcRequest, clamp_max_files, normalize_buttons,
};
pub use thread::{ThreadMessage, ThreadState};
