// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Domain records.
//!
//! These are the values held by the replicated maps and stored as JSON in
//! the snapshot store. Optional and late-added fields carry `#[serde(default)]`
//! so rows written by older or newer builds still decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn all() -> &'static [$name] {
                &[$(Self::$variant),+]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            /// Case-insensitive.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                $(
                    if s.eq_ignore_ascii_case($text) {
                        return Ok(Self::$variant);
                    }
                )+
                Err(format!("unknown {}: {}", stringify!($name), s))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Species {
    Dog,
    Cat,
    Rabbit,
    Bird,
    Other,
}

string_enum!(Species { Dog => "Dog", Cat => "Cat", Rabbit => "Rabbit", Bird => "Bird", Other => "Other" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

string_enum!(Gender { Male => "Male", Female => "Female" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HomeType {
    House,
    Apartment,
    Condo,
    Farm,
}

string_enum!(HomeType { House => "House", Apartment => "Apartment", Condo => "Condo", Farm => "Farm" });

/// Pet lifecycle. `available` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PetStatus {
    Available,
    Adopted,
    Removed,
}

string_enum!(PetStatus { Available => "available", Adopted => "adopted", Removed => "removed" });

impl PetStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Available)
    }
}

/// Application lifecycle. `pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Rejected,
}

string_enum!(ApplicationStatus { Pending => "pending", Approved => "approved", Rejected => "rejected" });

fn default_health_status() -> String {
    "Healthy".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pet {
    pub id: String,
    pub name: String,
    pub species: Species,
    pub breed: String,
    pub age: u8,
    pub gender: Gender,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_health_status")]
    pub health_status: String,
    pub status: PetStatus,
    pub shelter_id: String,
    #[serde(default)]
    pub shelter_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub adopted_by: Option<String>,
    #[serde(default)]
    pub adopted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub removal_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdoptionApplication {
    pub id: String,
    pub pet_id: String,
    pub applicant_name: String,
    pub applicant_email: String,
    pub applicant_phone: String,
    #[serde(default)]
    pub has_experience: bool,
    #[serde(default)]
    pub has_other_pets: bool,
    pub home_type: HomeType,
    pub reason: String,
    pub status: ApplicationStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub reviewed_by: Option<String>,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Shelter that took the application.
    #[serde(default)]
    pub shelter_id: String,
}

/// Filter for [`list_pets`](super::ShelterService::list_pets).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PetFilter {
    #[default]
    All,
    Available,
    Adopted,
    Removed,
}

impl PetFilter {
    pub fn matches(&self, pet: &Pet) -> bool {
        match self {
            Self::All => true,
            Self::Available => pet.status == PetStatus::Available,
            Self::Adopted => pet.status == PetStatus::Adopted,
            Self::Removed => pet.status == PetStatus::Removed,
        }
    }
}

impl FromStr for PetFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "available" => Ok(Self::Available),
            "adopted" => Ok(Self::Adopted),
            "removed" => Ok(Self::Removed),
            other => Err(format!("unknown pet filter: {}", other)),
        }
    }
}

/// One line of the recent adoptions list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdoptionSummary {
    pub pet_id: String,
    pub pet_name: String,
    pub species: Species,
    pub adopted_by: Option<String>,
    pub adopted_at: Option<DateTime<Utc>>,
}

/// Aggregate view computed from the current replica contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShelterStats {
    pub total_pets: usize,
    pub available: usize,
    pub adopted: usize,
    pub removed: usize,
    pub pending_applications: usize,
    pub total_applications: i64,
    pub total_adoptions: i64,
    /// Available pets only.
    pub species_breakdown: BTreeMap<Species, usize>,
    pub recent_adoptions: Vec<AdoptionSummary>,
    pub connected_peers: usize,
}
