use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::detection::DetectionClass;
use crate::services::coords::{CenterBox, CornerBox, RawDetection};

/// The detection backends, one HTTP model service each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DetectorKind {
    Bees,
    Cells,
    Cups,
    Queens,
    Varroa,
    VarroaBottom,
}

impl DetectorKind {
    /// Map a backend class index to our label. `None` for classes we do not keep.
    fn class_for(self, index: u32) -> Option<DetectionClass> {
        use DetectionClass::*;
        match (self, index) {
            (DetectorKind::Bees, 0) => Some(WorkerBee),
            (DetectorKind::Bees, 1) => Some(Drone),
            (DetectorKind::Bees, 2) => Some(WorkerBeeWithPollen),
            (DetectorKind::Bees, 3) => Some(Queen),
            (DetectorKind::Cells, 0) => Some(CappedBrood),
            (DetectorKind::Cells, 1) => Some(Eggs),
            (DetectorKind::Cells, 2) => Some(Honey),
            (DetectorKind::Cells, 3) => Some(Larvae),
            (DetectorKind::Cells, 4) => Some(Nectar),
            (DetectorKind::Cells, 5) => Some(Pollen),
            (DetectorKind::Cells, 6) => Some(EmptyCell),
            (DetectorKind::Cups, _) => Some(QueenCup),
            (DetectorKind::Queens, _) => Some(Queen),
            (DetectorKind::Varroa | DetectorKind::VarroaBottom, _) => Some(VarroaMite),
            _ => None,
        }
    }
}

/// Base URLs of the detection backends.
#[derive(Debug, Clone)]
pub struct DetectorEndpoints {
    pub bees: String,
    pub cells: String,
    pub cups: String,
    pub queens: String,
    pub varroa: String,
    pub varroa_bottom: String,
}

impl DetectorEndpoints {
    fn url(&self, kind: DetectorKind) -> &str {
        match kind {
            DetectorKind::Bees => &self.bees,
            DetectorKind::Cells => &self.cells,
            DetectorKind::Cups => &self.cups,
            DetectorKind::Queens => &self.queens,
            DetectorKind::Varroa => &self.varroa,
            DetectorKind::VarroaBottom => &self.varroa_bottom,
        }
    }
}

/// Center/size box normalized to the submitted image (grid detectors).
#[derive(Deserialize)]
struct CenterItem {
    n: u32,
    x: f64,
    y: f64,
    w: f64,
    h: f64,
    c: f64,
}

/// Edge box normalized to the submitted image (classifier).
#[derive(Deserialize)]
struct CornerItem {
    top_row: f64,
    left_col: f64,
    bottom_row: f64,
    right_col: f64,
    value: f64,
}

#[derive(Deserialize)]
struct DetectorResponse<T> {
    result: Vec<T>,
}

/// A detection backend. `content_type` names the encoding of `image`.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(
        &self,
        kind: DetectorKind,
        image: Vec<u8>,
        content_type: &str,
    ) -> Result<Vec<RawDetection>, DetectorError>;
}

/// Client for the detection model services.
pub struct DetectorClient {
    http: Client,
    endpoints: DetectorEndpoints,
}

impl DetectorClient {
    /// `timeout` bounds each request, so one slow tile cannot hold up a job.
    pub fn new(endpoints: DetectorEndpoints, timeout: Duration) -> Result<Self, DetectorError> {
        let http = Client::builder().timeout(timeout).build().map_err(DetectorError::Http)?;
        Ok(Self { http, endpoints })
    }
}

/// Upload file name for a MIME type, so backends that sniff the extension agree with the header.
fn upload_file_name(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "image.png",
        "image/webp" => "image.webp",
        "image/jpeg" => "image.jpg",
        _ => "image",
    }
}

#[async_trait]
impl Detector for DetectorClient {
    /// Send one image (a tile or a whole photo) and return the raw boxes.
    async fn detect(
        &self,
        kind: DetectorKind,
        image: Vec<u8>,
        content_type: &str,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        let part = Part::bytes(image)
            .file_name(upload_file_name(content_type))
            .mime_str(content_type)
            .map_err(DetectorError::Http)?;
        let form = Form::new().part("file", part);

        let response = self
            .http
            .post(self.endpoints.url(kind))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DetectorError::Timeout(kind)
                } else {
                    DetectorError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectorError::Status { kind, status: status.as_u16(), body });
        }

        let body = response.text().await.map_err(DetectorError::Http)?;
        parse_response(kind, &body)
    }
}

/// Parse a backend reply in that backend's native convention.
pub fn parse_response(kind: DetectorKind, body: &str) -> Result<Vec<RawDetection>, DetectorError> {
    if kind == DetectorKind::Queens {
        let resp: DetectorResponse<CornerItem> = serde_json::from_str(body).map_err(DetectorError::Parse)?;
        return Ok(resp
            .result
            .into_iter()
            .map(|item| RawDetection::Corner {
                class: DetectionClass::Queen,
                bbox: CornerBox {
                    top_row: item.top_row,
                    left_col: item.left_col,
                    bottom_row: item.bottom_row,
                    right_col: item.right_col,
                },
                confidence: item.value,
            })
            .collect());
    }

    let resp: DetectorResponse<CenterItem> = serde_json::from_str(body).map_err(DetectorError::Parse)?;
    Ok(resp
        .result
        .into_iter()
        .filter_map(|item| {
            let class = kind.class_for(item.n);
            if class.is_none() {
                tracing::debug!(detector = %kind, class_index = item.n, "Skipping unknown class");
            }
            class.map(|class| RawDetection::Center {
                class,
                bbox: CenterBox {
                    cx: item.x,
                    cy: item.y,
                    w: item.w,
                    h: item.h,
                },
                confidence: item.c,
            })
        })
        .collect())
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("{0} detector timed out")]
    Timeout(DetectorKind),

    #[error("{kind} detector returned {status}: {body}")]
    Status { kind: DetectorKind, status: u16, body: String },

    #[error("Failed to parse detector response: {0}")]
    Parse(#[source] serde_json::Error),
}
