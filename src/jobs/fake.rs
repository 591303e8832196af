//! In-process `MatchingJobClient` for coordinator tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{JobOutcome, MatchingJobClient};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Accept the job, report nothing inline
    Deferred,
    Outcome(JobOutcome),
    Unavailable,
}

pub(crate) struct FakeJobClient {
    reply: Mutex<Reply>,
    pub identification_calls: AtomicUsize,
    pub processing_calls: AtomicUsize,
}

impl FakeJobClient {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply: Mutex::new(reply),
            identification_calls: AtomicUsize::new(0),
            processing_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    fn reply(&self) -> Reply {
        self.reply.lock().unwrap().clone()
    }

    /// Wait until `counter` reaches `expected`, giving spawned tasks time to run.
    pub async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {expected} job calls, saw {}",
            counter.load(Ordering::SeqCst)
        );
    }
}

#[async_trait]
impl MatchingJobClient for FakeJobClient {
    async fn request_sentence(&self) -> Result<String> {
        match self.reply() {
            Reply::Unavailable => Err(Error::JobUnavailable("fake outage".into())),
            _ => Ok("the early bird catches the worm".to_string()),
        }
    }

    async fn request_identification(&self, _user: Uuid) -> Result<Option<JobOutcome>> {
        self.identification_calls.fetch_add(1, Ordering::SeqCst);
        match self.reply() {
            Reply::Deferred => Ok(None),
            Reply::Outcome(outcome) => Ok(Some(outcome)),
            Reply::Unavailable => Err(Error::JobUnavailable("fake outage".into())),
        }
    }

    async fn process_reference_recordings(&self, _user: Uuid) -> Result<()> {
        self.processing_calls.fetch_add(1, Ordering::SeqCst);
        match self.reply() {
            Reply::Unavailable => Err(Error::JobUnavailable("fake outage".into())),
            _ => Ok(()),
        }
    }
}
