use std::io::BufReader;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use reqwest::blocking::{Client, RequestBuilder};

use crate::core::{HttpRequest, RawResponse, Scheduler, StreamingResponse, Transport};
use crate::error::NetworkError;

/// Blocking reqwest transport; one pooled client shared by every call chain.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { http })
    }

    fn build(&self, request: HttpRequest<'_>) -> RequestBuilder {
        let builder = self
            .http
            .request(request.method, request.url)
            .headers(request.headers.clone())
            .timeout(request.timeout);
        match request.body {
            Some(body) => builder.json(body),
            None => builder,
        }
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: HttpRequest<'_>) -> Result<RawResponse, NetworkError> {
        let resp = self.build(request).send()?;
        let status = resp.status().as_u16();
        let body = resp.bytes()?;
        Ok(RawResponse::new(status, body.to_vec()))
    }

    // The request timeout keeps running while the body is read.
    fn send_streaming(&self, request: HttpRequest<'_>) -> Result<StreamingResponse, NetworkError> {
        let resp = self.build(request).send()?;
        Ok(StreamingResponse {
            status: resp.status().as_u16(),
            body: Box::new(BufReader::new(resp)),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemScheduler;

impl Scheduler for SystemScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, delay: Duration) {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}
