use serde::Deserialize;
use thiserror::Error;

/// One parcel record, keyed by the id it was fetched with.
#[derive(Debug, Clone, PartialEq)]
pub struct Parcel {
    pub id: i64,
    pub municipality_name: Option<String>,
    pub parcel_number: Option<String>,
    pub address: Option<String>,
    pub owner_name: Option<String>,
    pub owner_ownership_type: Option<String>,
    pub owner_address: Option<String>,
    pub area: Option<f64>,
}

impl Parcel {
    /// A parcel with only its id set.
    pub fn bare(id: i64) -> Self {
        Self {
            id,
            municipality_name: None,
            parcel_number: None,
            address: None,
            owner_name: None,
            owner_ownership_type: None,
            owner_address: None,
            area: None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not a parcel document: {0}")]
    Invalid(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParcelInfo {
    cad_municipality_name: Option<String>,
    parcel_number: Option<String>,
    address: Option<String>,
    area: Option<Area>,
    possession_sheets: Option<Vec<PossessionSheet>>,
}

/// The remote sends area either as a number or a numeric string.
#[derive(Deserialize)]
#[serde(untagged)]
enum Area {
    Number(f64),
    Text(String),
}

#[derive(Deserialize)]
struct PossessionSheet {
    possessors: Option<Vec<Possessor>>,
}

#[derive(Deserialize)]
struct Possessor {
    name: Option<String>,
    ownership: Option<String>,
    address: Option<String>,
}

/// Parses a JSON parcel document into a [`Parcel`] stored under `id`.
///
/// The owner fields come from the first possessor of the first possession sheet that has any.
pub fn parse_parcel(id: i64, payload: &str) -> Result<Parcel, ParseError> {
    let payload = payload.trim();
    if payload.is_empty() || payload == "null" || payload == "{}" {
        return Err(ParseError::Empty);
    }

    let info: ParcelInfo =
        serde_json::from_str(payload).map_err(|e| ParseError::Invalid(e.to_string()))?;

    let owner = info
        .possession_sheets
        .unwrap_or_default()
        .into_iter()
        .find_map(|sheet| sheet.possessors.and_then(|p| p.into_iter().next()));

    let area = match info.area {
        Some(Area::Number(n)) => Some(n),
        Some(Area::Text(s)) => s.trim().replace(',', ".").parse().ok(),
        None => None,
    };

    let mut parcel = Parcel {
        municipality_name: info.cad_municipality_name,
        parcel_number: info.parcel_number,
        address: info.address,
        area,
        ..Parcel::bare(id)
    };
    if let Some(owner) = owner {
        parcel.owner_name = owner.name;
        parcel.owner_ownership_type = owner.ownership;
        parcel.owner_address = owner.address;
    }
    Ok(parcel)
}
