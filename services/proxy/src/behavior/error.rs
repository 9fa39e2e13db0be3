use std::io;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, RngCore};
use tracing::debug;

use super::{count, Behavior, Direction, Forward, SharedCounter};
use crate::options::{OptionSpec, OptionValue, Settings};

/// Synthetic error pages: status, reason and body.
const HTTP_ERRORS: &[(u16, &str, &str)] = &[
    (
        500,
        "Internal Server Error",
        "<p>The server encountered an internal error and was unable to complete your request.  \
         Either the server is overloaded or there is an error in the application.</p>",
    ),
    (
        501,
        "Not Implemented",
        "<p>The server does not support the action requested by the browser.</p>",
    ),
    (
        502,
        "Bad Gateway",
        "<p>The proxy server received an invalid response from an upstream server.</p>",
    ),
    (
        503,
        "Service Unavailable",
        "<p>The server is temporarily unable to service your request due to maintenance \
         downtime or capacity problems.  Please try again later.</p>",
    ),
];

const INJECTED_BYTES: usize = 100;
const NOISE_BYTES: usize = 1000;

pub(super) const INJECT: OptionSpec = OptionSpec::new(
    "inject",
    "Inject random bytes inside valid data instead of replacing it",
    OptionValue::Bool(false),
);

const OPTIONS: &[OptionSpec] = &[
    INJECT,
    OptionSpec::new(
        "warmup",
        "Number of calls forwarded untouched before erroring out",
        OptionValue::Int(0),
    )
    .at_least(0.0),
];

/// Reads one chunk from the source and answers with garbage.
///
/// Requests on an HTTP proxy get a random 5xx page written back to the client
/// and the client socket closed. Other requests are forwarded untouched.
/// Responses are replaced with random bytes, or have random bytes spliced
/// into their middle when `inject` is set.
pub struct Corrupter {
    rng: Mutex<StdRng>,
}

impl Corrupter {
    pub fn new(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    pub async fn corrupt(&self, fwd: &Forward<'_>, inject: bool) -> io::Result<()> {
        let data = fwd.source.read_chunk(fwd.buffer).await?;
        if data.is_empty() {
            return Ok(());
        }

        match fwd.direction {
            Direction::ToBackend if fwd.protocol == "http" => {
                let page = self.http_error_page();
                fwd.source.write_all(&page).await?;
                fwd.source.close();
            }
            Direction::ToBackend => fwd.dest.write_all(&data).await?,
            Direction::ToClient if inject => {
                let middle = data.len() / 2;
                let mut spliced = Vec::with_capacity(data.len() + INJECTED_BYTES);
                spliced.extend_from_slice(&data[..middle]);
                spliced.extend_from_slice(&self.noise(INJECTED_BYTES));
                spliced.extend_from_slice(&data[middle..]);
                fwd.dest.write_all(&spliced).await?;
            }
            Direction::ToClient => fwd.dest.write_all(&self.noise(NOISE_BYTES)).await?,
        }
        debug!(conn_id = fwd.conn_id, direction = %fwd.direction, inject, "Corrupted message");
        Ok(())
    }

    fn noise(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        self.lock_rng().fill_bytes(&mut bytes);
        bytes
    }

    fn http_error_page(&self) -> Vec<u8> {
        let index = self.lock_rng().random_range(0..HTTP_ERRORS.len());
        let (code, reason, description) = HTTP_ERRORS[index];
        let body = format!(
            "<!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 3.2 Final//EN\">\n\
             <title>{code} {reason}</title>\n<h1>{reason}</h1>\n{description}\n"
        );
        format!(
            "HTTP/1.1 {code} {reason}\r\n\
             Content-Type: text/html; charset=UTF-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        )
        .into_bytes()
    }

    fn lock_rng(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sends back errors or random data after an optional warmup.
pub struct ErrorInjection {
    corrupter: Corrupter,
    calls: SharedCounter,
}

impl ErrorInjection {
    pub fn new(rng: StdRng) -> Self {
        Self {
            corrupter: Corrupter::new(rng),
            calls: SharedCounter::default(),
        }
    }
}

#[async_trait]
impl Behavior for ErrorInjection {
    fn name(&self) -> &'static str {
        "error"
    }

    fn description(&self) -> &'static str {
        "Reads the packets that have been sent then sends back errors or random data"
    }

    fn options(&self) -> &'static [OptionSpec] {
        OPTIONS
    }

    async fn before_forward(&self, fwd: &Forward<'_>, settings: &Settings) -> io::Result<bool> {
        if self.calls.try_consume(count(settings, "warmup")) {
            return Ok(true);
        }
        self.corrupter.corrupt(fwd, settings.bool("inject")).await?;
        Ok(false)
    }
}
