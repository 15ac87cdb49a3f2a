//! EchoLink proxy directory registration
//!
//! A registered proxy periodically announces its name, comment and slot
//! occupancy to the EchoLink directory so clients can discover it. The
//! service runs as a background task, re-reporting at least every ten
//! minutes and immediately after every occupancy change.
//!
//! Registration is optional; without a configured `RegistrationName`
//! every call on this service is a no-op.

use crate::config::Config;
use crate::error::ProxyError;
use crate::protocol::md5;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Update (at least) every 10 minutes
const UPDATE_INTERVAL: Duration = Duration::from_secs(600);

/// Directory host reports are posted to
const DIRECTORY_HOST: &str = "www.echolink.org";

/// Salt mixed into the registration digest
const DIGEST_SALT: &str = "#5A!zu";

/// Protocol version reported to the directory
const PROTOCOL_VERSION: &str = "1.2.3o";

/// Registration status reported to the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// At least one slot is free
    Ready,

    /// Every slot is occupied
    Busy,

    /// The proxy is going away
    Off,
}

impl Status {
    fn phrase(self) -> &'static str {
        match self {
            Status::Ready => "Ready",
            Status::Busy => "Busy",
            Status::Off => "Off",
        }
    }
}

#[derive(Debug)]
struct RegState {
    used: usize,
    total: usize,
    status: Status,
    update: bool,
    sentinel: bool,
}

#[derive(Debug)]
struct RegInner {
    name: String,
    comment: String,
    public: bool,
    suffix: String,
    state: Mutex<RegState>,
    notify: Notify,
}

/// Handle on the directory registration service
#[derive(Debug)]
pub struct RegistrationService {
    inner: Option<Arc<RegInner>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RegistrationService {
    /// Create the service from the proxy configuration
    ///
    /// Disabled (all calls no-ops) unless a registration name is
    /// configured.
    pub fn new(config: &Config) -> Self {
        let inner = config.reg_name.as_ref().map(|name| {
            let public_addr = config.public_addr.clone().unwrap_or_default();

            Arc::new(RegInner {
                name: name.clone(),
                comment: config.reg_comment.clone().unwrap_or_default(),
                public: config.is_public(),
                suffix: registration_suffix(name, &public_addr, config.port),
                state: Mutex::new(RegState {
                    used: 0,
                    total: 0,
                    status: Status::Ready,
                    update: false,
                    sentinel: false,
                }),
                notify: Notify::new(),
            })
        });

        RegistrationService {
            inner,
            handle: Mutex::new(None),
        }
    }

    /// Whether a registration name is configured
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Start the background reporting task
    pub fn start(&self) {
        let Some(inner) = &self.inner else {
            return;
        };

        let mut handle = self.handle.lock().unwrap();
        if handle.is_none() {
            *handle = Some(tokio::spawn(registration_task(inner.clone())));
        }
    }

    /// Record a new slot occupancy and trigger a report
    pub fn update(&self, slots_used: usize, slots_total: usize) {
        let Some(inner) = &self.inner else {
            return;
        };

        let mut state = inner.state.lock().unwrap();
        if state.sentinel {
            return;
        }

        state.status = if slots_used >= slots_total {
            Status::Busy
        } else {
            Status::Ready
        };
        state.used = slots_used;
        state.total = slots_total;
        state.update = true;
        inner.notify.notify_one();
    }

    /// Send a final `Off` report and stop the background task
    pub async fn stop(&self) {
        let Some(inner) = &self.inner else {
            return;
        };

        {
            let mut state = inner.state.lock().unwrap();
            state.sentinel = true;
            state.update = true;
            state.status = Status::Off;
            inner.notify.notify_one();
        }

        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn registration_task(inner: Arc<RegInner>) {
    loop {
        let (status, used, total) = {
            let mut state = inner.state.lock().unwrap();
            state.update = false;
            (state.status, state.used, state.total)
        };

        debug!(
            "Updating registration ({} {}, {}/{})",
            inner.name,
            status.phrase(),
            used,
            total
        );

        if let Err(e) = send_report(&inner, status, used, total).await {
            debug!("Proxy registration failed: {}", e);
        }

        {
            let state = inner.state.lock().unwrap();
            if state.update {
                continue;
            }
            if state.sentinel {
                break;
            }
        }

        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = tokio::time::sleep(UPDATE_INTERVAL) => {}
        }
    }
}

async fn send_report(
    inner: &RegInner,
    status: Status,
    used: usize,
    total: usize,
) -> Result<(), ProxyError> {
    let body = report_body(
        &inner.name,
        &inner.comment,
        inner.public,
        status,
        used,
        total,
        &inner.suffix,
    );
    let header = report_header(body.len());

    let mut conn = TcpStream::connect((DIRECTORY_HOST, 80)).await?;
    conn.write_all(header.as_bytes()).await?;
    conn.write_all(body.as_bytes()).await?;
    conn.flush().await?;

    let mut response = [0u8; 13];
    conn.read_exact(&mut response).await?;

    if &response != b"HTTP/1.1 200 " {
        return Err(ProxyError::Registration(format!(
            "unexpected directory response: {}",
            String::from_utf8_lossy(&response)
        )));
    }

    Ok(())
}

fn report_header(body_len: usize) -> String {
    format!(
        "POST /proxypost.jsp HTTP/1.1\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Cache-Control: no-cache\r\n\
         Pragma: no-cache\r\n\
         User-Agent: elproxy/{}\r\n\
         Host: {}\r\n\
         Accept: text/html, image/gif, image/jpeg, *; q=.2, */*; q=.2\r\n\
         Connection: keep-alive\r\n\
         Content-Length: {}\r\n\r\n",
        crate::VERSION,
        DIRECTORY_HOST,
        body_len
    )
}

fn report_body(
    name: &str,
    comment: &str,
    public: bool,
    status: Status,
    used: usize,
    total: usize,
    suffix: &str,
) -> String {
    format!(
        "name={}&comment={} [{}/{}]&public={}&status={}{}",
        name,
        comment,
        used,
        total,
        if public { 'Y' } else { 'N' },
        status.phrase(),
        suffix
    )
}

/// Precompute the constant tail of every report
///
/// Carries the announced address, a salted digest tying the report to
/// the proxy's name, the port, and the protocol version.
fn registration_suffix(name: &str, public_addr: &str, port: u16) -> String {
    let mut material = String::with_capacity(name.len() + public_addr.len() + DIGEST_SALT.len());
    material.push_str(name);
    material.push_str(public_addr);
    material.push_str(DIGEST_SALT);

    let digest = hex::encode_upper(md5(material.as_bytes()));

    format!("&a={public_addr}&d={digest}&p={port}&v={PROTOCOL_VERSION}")
}
