//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `daemon`        | `Daemon`, `Stop`, `Status`                         |
//! | `mailbox`       | `Send`, `List`, `Read`, `Thread`                   |
//! | `config`        | `Config`                                           |

pub mod config;
pub mod daemon;
pub mod mailbox;

pub use config::cmd_config;
pub use daemon::{DaemonOverrides, cmd_daemon, cmd_status, cmd_stop};
pub use mailbox::{SendRequest, build_list_filter, cmd_list, cmd_read, cmd_send, cmd_thread};
