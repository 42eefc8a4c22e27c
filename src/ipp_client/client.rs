use std::{collections::{BTreeMap, HashMap}, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use ipp::prelude::*;
use log::debug;
use snafu::{OptionExt, Snafu};

use crate::config::PrinterConfig;
use crate::keepalive::render::RenderedDocument;

use super::models::TelemetrySnapshot;

/// Reads device status. Implementations must return within `timeout`.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch(&self, printer: &PrinterConfig, timeout: Duration) -> Result<TelemetrySnapshot, TelemetryError>;
}

/// Sends one document to a printer. Implementations must return within `timeout`.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, printer: &PrinterConfig, job_name: &str, document: RenderedDocument, timeout: Duration) -> Result<SubmittedJob, SubmitError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: Option<i32>,
}

/// IPP client for a single printer endpoint at a time.
#[derive(Debug, Clone)]
pub struct IppDevice {
    ignore_tls_errors: bool,
}

impl IppDevice {
    pub fn new(ignore_tls_errors: bool) -> Self {
        Self { ignore_tls_errors }
    }

    fn client(&self, uri: Uri, timeout: Duration) -> AsyncIppClient {
        AsyncIppClient::builder(uri).ignore_tls_errors(self.ignore_tls_errors).request_timeout(timeout).build()
    }

    /// Send a get-printer-attributes request to `uri` and return the printer attribute group.
    pub async fn printer_attributes(&self, uri: &str, timeout: Duration) -> Result<HashMap<String, IppAttribute>, TelemetryError> {
        let uri_p = uri.parse::<Uri>().map_err(|e| TelemetryError::Protocol {
            uri: uri.to_owned(),
            message: format!("invalid URI: {e}"),
        })?;
        let operation = IppOperationBuilder::get_printer_attributes(uri_p.clone()).build();
        let client = self.client(uri_p, timeout);

        let response = match tokio::time::timeout(timeout, client.send(operation)).await {
            Err(_) => return UnreachableSnafu { uri, message: format!("no response within {}", humantime::format_duration(timeout)) }.fail(),
            Ok(Err(e)) => return UnreachableSnafu { uri, message: e.to_string() }.fail(),
            Ok(Ok(response)) => response,
        };

        let status = response.header().status_code();
        if !status.is_success() {
            return ProtocolSnafu { uri, message: format!("printer answered with status {status:?}") }.fail();
        }

        let group = response
            .attributes()
            .groups_of(DelimiterTag::PrinterAttributes)
            .next()
            .context(ProtocolSnafu { uri, message: "response has no printer attributes" })?;
        Ok(group.attributes().clone())
    }

    /// All printer attributes as display strings, sorted by name.
    pub async fn dump_attributes(&self, uri: &str, timeout: Duration) -> Result<BTreeMap<String, String>, TelemetryError> {
        let attributes = self.printer_attributes(uri, timeout).await?;
        Ok(attributes.into_iter().map(|(name, attribute)| (name, attribute.value().to_string())).collect())
    }
}

#[async_trait]
impl TelemetrySource for IppDevice {
    async fn fetch(&self, printer: &PrinterConfig, timeout: Duration) -> Result<TelemetrySnapshot, TelemetryError> {
        let attributes = self.printer_attributes(&printer.uri, timeout).await?;
        let snapshot = TelemetrySnapshot::from_attributes(&printer.id, Utc::now(), &attributes);
        debug!("Fetched telemetry for {}: state={:?} counter={:?}", printer.id, snapshot.state, snapshot.job_counter);
        Ok(snapshot)
    }
}

#[async_trait]
impl JobSubmitter for IppDevice {
    async fn submit(&self, printer: &PrinterConfig, job_name: &str, document: RenderedDocument, timeout: Duration) -> Result<SubmittedJob, SubmitError> {
        let uri_p = printer.uri.parse::<Uri>().map_err(|e| SubmitError::Rejected {
            printer_id: printer.id.clone(),
            message: format!("invalid URI: {e}"),
        })?;
        let payload = IppPayload::new_async(futures::io::Cursor::new(document.bytes));
        let operation = IppOperationBuilder::print_job(uri_p.clone(), payload)
            .job_title(job_name)
            .document_format(document.mime)
            .build();
        let client = self.client(uri_p, timeout);

        let response = match tokio::time::timeout(timeout, client.send(operation)).await {
            Err(_) => return TransportSnafu { printer_id: &printer.id, message: format!("no response within {}", humantime::format_duration(timeout)) }.fail(),
            Ok(Err(e)) => return TransportSnafu { printer_id: &printer.id, message: e.to_string() }.fail(),
            Ok(Ok(response)) => response,
        };

        let status = response.header().status_code();
        if !status.is_success() {
            return RejectedSnafu { printer_id: &printer.id, message: format!("printer answered with status {status:?}") }.fail();
        }

        let job_id = response
            .attributes()
            .groups_of(DelimiterTag::JobAttributes)
            .next()
            .and_then(|group| group.attributes().get("job-id"))
            .and_then(|attribute| attribute.value().as_integer().copied());
        Ok(SubmittedJob { job_id })
    }
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryErrorKind {
    Unreachable,
    ProtocolError,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TelemetryError {
    #[snafu(display("Printer at {uri} is unreachable: {message}"))]
    Unreachable { uri: String, message: String },

    #[snafu(display("Printer at {uri} sent an unexpected response: {message}"))]
    Protocol { uri: String, message: String },
}

impl TelemetryError {
    pub fn kind(&self) -> TelemetryErrorKind {
        match self {
            TelemetryError::Unreachable { .. } => TelemetryErrorKind::Unreachable,
            TelemetryError::Protocol { .. } => TelemetryErrorKind::ProtocolError,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SubmitError {
    #[snafu(display("Could not deliver job to {printer_id}: {message}"))]
    Transport { printer_id: String, message: String },

    #[snafu(display("Printer {printer_id} rejected the job: {message}"))]
    Rejected { printer_id: String, message: String },
}
