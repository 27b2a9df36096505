//! GeoLite2 City database access.

use std::net::IpAddr;
use std::path::Path;

use anyhow::Result;
use log::info;
use maxminddb::Reader;

use crate::config::GEOLITE_DOWNLOAD_TIMEOUT;
use crate::error_handling::InitializationError;
use crate::models::GeoLocation;

/// Read-only city lookup interface the resolver consumes.
pub trait CityDatabase: Send + Sync {
    /// Returns coordinates for an IP, or `None` when the database has no
    /// usable record. A record at `(0, 0)` counts as unusable.
    fn lookup_city(&self, ip: IpAddr) -> Result<Option<GeoLocation>>;
}

/// [`CityDatabase`] over a local `GeoLite2-City.mmdb` file.
#[derive(Debug)]
pub struct GeoLiteDb {
    reader: Reader<Vec<u8>>,
}

impl GeoLiteDb {
    /// Opens the database, downloading it first when the file is missing
    /// and auto-download is enabled. A missing file with auto-download off
    /// is a fatal startup error.
    pub async fn open(
        db_path: &str,
        download_url: &str,
        auto_download: bool,
    ) -> Result<Self, InitializationError> {
        ensure_database(db_path, download_url, auto_download).await?;

        let bytes = std::fs::read(db_path).map_err(|e| {
            InitializationError::GeoLiteError(format!("failed to read {db_path}: {e}"))
        })?;
        let reader = Reader::from_source(bytes).map_err(|e| {
            InitializationError::GeoLiteError(format!("failed to parse {db_path}: {e}"))
        })?;
        Ok(GeoLiteDb { reader })
    }
}

impl CityDatabase for GeoLiteDb {
    fn lookup_city(&self, ip: IpAddr) -> Result<Option<GeoLocation>> {
        let lookup = match self.reader.lookup(ip) {
            Ok(result) => result,
            Err(_) => return Ok(None),
        };
        if !lookup.has_data() {
            return Ok(None);
        }
        let city: maxminddb::geoip2::City = match lookup.decode() {
            Ok(Some(city)) => city,
            _ => return Ok(None),
        };

        let latitude = city.location.latitude.unwrap_or(0.0);
        let longitude = city.location.longitude.unwrap_or(0.0);
        // Null island means the database has no real fix for this IP.
        if latitude == 0.0 && longitude == 0.0 {
            return Ok(None);
        }

        let country_code = city
            .country
            .iso_code
            .map(|code| code.trim().to_uppercase())
            .filter(|code| !code.is_empty())
            .unwrap_or_else(|| "XX".to_string());
        let city_name = city
            .city
            .names
            .english
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        Ok(Some(GeoLocation {
            latitude,
            longitude,
            country_code,
            city: city_name,
            validator_address: String::new(),
        }))
    }
}

async fn ensure_database(
    db_path: &str,
    download_url: &str,
    auto_download: bool,
) -> Result<(), InitializationError> {
    if Path::new(db_path).exists() {
        return Ok(());
    }
    if !auto_download {
        return Err(InitializationError::GeoLiteError(format!(
            "GeoLite DB not found at {db_path} and auto-download is disabled"
        )));
    }
    if download_url.trim().is_empty() {
        return Err(InitializationError::GeoLiteError(format!(
            "GeoLite DB not found at {db_path} and no download URL configured"
        )));
    }

    info!("GeoLite DB missing at {db_path}; downloading from {download_url}");
    download_file(download_url, db_path)
        .await
        .map_err(|e| InitializationError::GeoLiteError(format!("download failed: {e}")))?;
    info!("GeoLite DB downloaded to {db_path}");
    Ok(())
}

async fn download_file(url: &str, destination: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(GEOLITE_DOWNLOAD_TIMEOUT)
        .build()?;
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("download returned status {}", response.status());
    }
    let bytes = response.bytes().await?;

    if let Some(parent) = Path::new(destination).parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Write-then-rename so a crashed download never leaves a torn file.
    let tmp_path = format!("{destination}.tmp");
    std::fs::write(&tmp_path, &bytes)?;
    std::fs::rename(&tmp_path, destination)?;
    Ok(())
}
