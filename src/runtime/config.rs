use std::time::Duration;

use typed_builder::TypedBuilder;

use super::net::MAX_FRAME_LEN;

/// How logical thread tasks are scheduled and fed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Scheduling {
    /// Every task runs on the current thread's `LocalSet`, so each logical
    /// thread's queue only ever has producers on that one thread.
    InThread,
    /// Tasks run on the multi-threaded runtime and queues accept producers
    /// from any worker.
    #[default]
    Concurrent,
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct Config {
    /// Used in logs and status reports.
    #[builder(default = String::from("weave"), setter(into))]
    pub process_name: String,
    #[builder(default)]
    pub scheduling: Scheduling,
    /// How long a logical thread waits for a response before giving up. Waits
    /// forever when unset.
    #[builder(default, setter(strip_option))]
    pub request_timeout: Option<Duration>,
    #[builder(default = MAX_FRAME_LEN)]
    pub max_frame_len: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}
