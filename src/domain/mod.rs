// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Domain operations layer: pets, adoption applications, counters.

pub mod model;
pub mod service;
pub mod validation;

pub use model::{
    AdoptionApplication, AdoptionSummary, ApplicationStatus, Gender, HomeType, Pet, PetFilter,
    PetStatus, ShelterStats, Species,
};
pub use service::{ShelterService, TOTAL_ADOPTIONS, TOTAL_APPLICATIONS};
pub use validation::{ApplicationForm, PetForm, PetPatch};
