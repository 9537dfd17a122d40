//! Coarse network-derived location context, resolved once with a 24-hour
//! persisted cache.
//!
//! This is a soft-fail, non-blocking dependency: a fetch failure leaves all
//! fields absent and is never retried automatically.

use crate::store::{decode_record, encode_record, keys, KvStore};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Normalized geolocation fields from an ipinfo-style service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub postal: Option<String>,
    /// `"lat,long"` pair as reported by the service.
    pub loc: Option<String>,
    pub timezone: Option<String>,
    pub ip: Option<String>,
}

/// Fetches and caches geolocation context.
pub struct GeoResolver {
    store: Arc<dyn KvStore>,
    client: Client,
    service_url: String,
    info: RwLock<Option<GeoInfo>>,
}

impl GeoResolver {
    pub fn new(store: Arc<dyn KvStore>, client: Client, service_url: String) -> Self {
        Self {
            store,
            client,
            service_url,
            info: RwLock::new(None),
        }
    }

    /// Resolve location info: adopt a parseable cache entry without touching
    /// the network, otherwise issue one GET to the geolocation service. On
    /// failure the fields stay absent.
    pub async fn resolve(&self) {
        if let Some(cached) = self.store.get(keys::GEO_INFO) {
            match decode_record::<GeoInfo>(&cached) {
                Some(info) => {
                    debug!("using cached geolocation info");
                    *self.info.write().expect("geo lock poisoned") = Some(info);
                    return;
                }
                None => {
                    // Corrupted cache entry: remove and refetch.
                    warn!("corrupted geolocation cache entry, removing");
                    self.store.remove(keys::GEO_INFO);
                }
            }
        }

        debug!(url = %self.service_url, "fetching geolocation info");
        match self.fetch().await {
            Ok(info) => {
                if let Some(encoded) = encode_record(&info) {
                    self.store
                        .set(keys::GEO_INFO, &encoded, Some(keys::GEO_TTL));
                }
                *self.info.write().expect("geo lock poisoned") = Some(info);
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch geolocation info");
            }
        }
    }

    async fn fetch(&self) -> crate::error::Result<GeoInfo> {
        let response = self.client.get(&self.service_url).send().await?;
        let response = response.error_for_status()?;
        let info = response.json::<GeoInfo>().await?;
        Ok(info)
    }

    /// The resolved fields, or `None` when unresolved or failed. Applied to
    /// events captured after resolution completes, never retroactively.
    pub fn current(&self) -> Option<GeoInfo> {
        self.info.read().expect("geo lock poisoned").clone()
    }
}
