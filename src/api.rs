use crate::error::LocationError;
use crate::geocode::ReverseGeocoder;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Reverse geocoding against a Nominatim-compatible endpoint.
pub struct NominatimGeocoder {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
pub struct ReverseResponse {
    pub address: Option<AddressParts>,
    pub display_name: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AddressParts {
    pub house_number: Option<String>,
    pub road: Option<String>,
    pub city: Option<String>,
    pub town: Option<String>,
    pub village: Option<String>,
    pub suburb: Option<String>,
}

impl ReverseResponse {
    /// "house-number road locality", skipping whatever is missing. Falls back
    /// to the full display name when none of the parts are present.
    pub fn short_address(&self) -> Option<String> {
        let parts = self.address.as_ref().map(|a| {
            let locality = a
                .city
                .as_ref()
                .or(a.town.as_ref())
                .or(a.village.as_ref())
                .or(a.suburb.as_ref());
            [a.house_number.as_ref(), a.road.as_ref(), locality]
                .into_iter()
                .flatten()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        });
        match parts {
            Some(line) if !line.is_empty() => Some(line),
            _ => self.display_name.clone().filter(|s| !s.trim().is_empty()),
        }
    }
}

impl NominatimGeocoder {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, LocationError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vantage/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Result<String, LocationError> {
        let url = format!(
            "{}?format=jsonv2&lat={}&lon={}",
            self.endpoint, latitude, longitude
        );

        let res = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<ReverseResponse>()
            .await?;

        if let Some(e) = &res.error {
            return Err(LocationError::GeocodeFailure(e.clone()));
        }
        res.short_address()
            .ok_or_else(|| LocationError::GeocodeFailure("no address for coordinate".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ReverseResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn formats_number_road_and_locality() {
        let res = parse(
            r#"{"display_name":"6, MetroTech Center, Downtown Brooklyn, Brooklyn, New York",
                "address":{"house_number":"6","road":"MetroTech Center","suburb":"Brooklyn","city":"New York"}}"#,
        );
        assert_eq!(res.short_address().unwrap(), "6 MetroTech Center New York");
    }

    #[test]
    fn missing_parts_are_skipped() {
        let res = parse(r#"{"address":{"road":"Jay Street","suburb":"Brooklyn"}}"#);
        assert_eq!(res.short_address().unwrap(), "Jay Street Brooklyn");
    }

    #[test]
    fn empty_address_uses_display_name_or_nothing() {
        let res = parse(r#"{"address":{},"display_name":"Atlantic Ocean"}"#);
        assert_eq!(res.short_address().unwrap(), "Atlantic Ocean");

        let res = parse(r#"{"error":"Unable to geocode"}"#);
        assert_eq!(res.short_address(), None);
        assert_eq!(res.error.as_deref(), Some("Unable to geocode"));
    }
}
