//! [`NasaImagery`] – Mars Rover Photos API client.
//!
//! Queries `{base_url}/rovers/{rover}/photos?sol=N&api_key=K`, keeps only the
//! configured camera, and trims each photo to `{id, earth_date, sol,
//! img_src}`. Requests are rate limited client-side.
//!
//! # Example
//!
//! ```rust,no_run
//! use solmem_runtime::nasa::NasaImagery;
//!
//! let imagery = NasaImagery::new("https://api.nasa.gov/mars-photos/api/v1", "DEMO_KEY")
//!     .with_camera("NAVCAM")
//!     .with_rate_limit(2);
//! ```

use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use solmem_types::{CollaboratorError, EarthDate, Photo};
use tracing::debug;

use crate::collaborators::{ImagerySource, http_error};

pub const DEFAULT_BASE_URL: &str = "https://api.nasa.gov/mars-photos/api/v1";
pub const DEFAULT_ROVER: &str = "curiosity";
pub const DEFAULT_CAMERA: &str = "NAVCAM";

const SERVICE: &str = "imagery";

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PhotosResponse {
    #[serde(default)]
    photos: Vec<ApiPhoto>,
}

#[derive(Deserialize)]
struct ApiPhoto {
    id: u64,
    sol: u32,
    camera: ApiCamera,
    img_src: String,
    earth_date: EarthDate,
}

#[derive(Deserialize)]
struct ApiCamera {
    name: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// NasaImagery
// ─────────────────────────────────────────────────────────────────────────────

/// [`ImagerySource`] backed by the Mars Rover Photos API.
pub struct NasaImagery {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    rover: String,
    camera: String,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl NasaImagery {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            rover: DEFAULT_ROVER.to_string(),
            camera: DEFAULT_CAMERA.to_string(),
            limiter: None,
        }
    }

    pub fn with_rover(mut self, rover: impl Into<String>) -> Self {
        self.rover = rover.into();
        self
    }

    pub fn with_camera(mut self, camera: impl Into<String>) -> Self {
        self.camera = camera.into();
        self
    }

    /// Allow at most `requests_per_second` API requests; `0` disables the limit.
    pub fn with_rate_limit(mut self, requests_per_second: u32) -> Self {
        self.limiter = NonZeroU32::new(requests_per_second)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));
        self
    }

    async fn throttle(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}

#[async_trait]
impl ImagerySource for NasaImagery {
    async fn photos(&self, earth_date: EarthDate, sol: u32) -> Result<Vec<Photo>, CollaboratorError> {
        self.throttle().await;
        let url = format!("{}/rovers/{}/photos", self.base_url, self.rover);
        let response: PhotosResponse = self
            .client
            .get(&url)
            .query(&[("sol", sol.to_string()), ("api_key", self.api_key.clone())])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| http_error(SERVICE, e))?
            .json()
            .await
            .map_err(|e| http_error(SERVICE, e))?;

        let total = response.photos.len();
        let photos: Vec<Photo> = response
            .photos
            .into_iter()
            .filter(|p| p.camera.name.eq_ignore_ascii_case(&self.camera))
            .map(|p| Photo {
                id: p.id,
                earth_date: p.earth_date,
                sol: p.sol,
                img_src: p.img_src,
            })
            .collect();
        debug!(%earth_date, sol, total, kept = photos.len(), camera = %self.camera, "fetched photo list");
        Ok(photos)
    }

    async fn download(&self, photo: &Photo) -> Result<Vec<u8>, CollaboratorError> {
        self.throttle().await;
        let bytes = self
            .client
            .get(&photo.img_src)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| http_error(SERVICE, e))?
            .bytes()
            .await
            .map_err(|e| http_error(SERVICE, e))?;
        Ok(bytes.to_vec())
    }
}
