//! HTTP job pipeline: a bounded priority queue fed by the control client's
//! receive loop, drained by a small pool of workers enforcing a hard 10s
//! per-job deadline. Grounded on `original_source/job_processor.py`
//! (`fetch`, the `time_ns()`-keyed queue, the fixed header dict).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::IpFamily;
use crate::outbound::{OutboundSender, PRIORITY_BULK};
use crate::wbi;

const JOB_DEADLINE: Duration = Duration::from_secs(10);
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/102.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct HttpJob {
    pub priority_key: u128,
    pub job_key: String,
    pub url: String,
}

impl HttpJob {
    pub fn new(job_key: String, url: String) -> Self {
        Self {
            priority_key: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos(),
            job_key,
            url,
        }
    }
}

impl PartialEq for HttpJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority_key == other.priority_key
    }
}
impl Eq for HttpJob {}
impl PartialOrd for HttpJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HttpJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest arrival (smallest nanosecond timestamp) pops first.
        other.priority_key.cmp(&self.priority_key)
    }
}

/// Shared FIFO-by-arrival priority queue of pending HTTP jobs.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Mutex<BinaryHeap<HttpJob>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BinaryHeap::new())),
        }
    }

    pub async fn push(&self, job: HttpJob) {
        self.inner.lock().await.push(job);
    }

    pub async fn pop(&self) -> Option<HttpJob> {
        self.inner.lock().await.pop()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct JobResult<'a> {
    key: &'a str,
    data: String,
}

/// Build the shared reqwest client used by all HTTP workers. `ip_family`
/// steers the resolver the way reqwest's `local_address` knob allows;
/// `both` leaves the default dual-stack resolution untouched.
pub fn build_client(ip_family: IpFamily) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(JOB_DEADLINE);
    builder = match ip_family {
        IpFamily::V4 => builder.local_address(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        IpFamily::V6 => builder.local_address(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)),
        IpFamily::Both => builder,
    };
    Ok(builder.build()?)
}

fn fresh_buvid3() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

/// Run one worker: pop jobs forever, fetch with a hard deadline, push the
/// result (or drop it) onto the outbound serializer.
pub async fn run_worker(client: reqwest::Client, queue: JobQueue, outbound: OutboundSender) {
    loop {
        let job = match queue.pop().await {
            Some(job) => job,
            None => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        match fetch_job(&client, &job).await {
            Ok(body) => {
                let result = JobResult {
                    key: &job.job_key,
                    data: body,
                };
                let payload = serde_json::to_string(&result).unwrap_or_default();
                outbound.send(PRIORITY_BULK, payload);
                debug!(key = %job.job_key, "job completed");
            }
            Err(e) => {
                warn!("Job {} failed: {}", job.job_key, e);
            }
        }
    }
}

async fn fetch_job(client: &reqwest::Client, job: &HttpJob) -> anyhow::Result<String> {
    let url = if wbi::needs_wbi_signing(&job.url) {
        wbi::sign_url(client, &job.url).await?
    } else {
        job.url.clone()
    };

    let cookie = format!("_uuid=; rpdid=; buvid3={}", fresh_buvid3());

    let fut = client
        .get(&url)
        .header("cookie", cookie)
        .header("user-agent", USER_AGENT)
        .send();

    let resp = timeout(JOB_DEADLINE, fut).await??;
    let body = timeout(JOB_DEADLINE, resp.text()).await??;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_pops_fifo_by_arrival() {
        let queue = JobQueue::new();
        let first = HttpJob::new("a".into(), "https://x/1".into());
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = HttpJob::new("b".into(), "https://x/2".into());

        queue.push(second.clone()).await;
        queue.push(first.clone()).await;

        assert_eq!(queue.pop().await.unwrap().job_key, "a");
        assert_eq!(queue.pop().await.unwrap().job_key, "b");
        assert!(queue.pop().await.is_none());
    }

    #[test]
    fn fresh_buvid3_rotates_every_call() {
        assert_ne!(fresh_buvid3(), fresh_buvid3());
    }
}
