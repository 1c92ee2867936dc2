// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Input forms and their validation.
//!
//! Forms carry raw values as the UI submits them. Validation parses them
//! into typed values and reports every violated field, not just the first.

use super::model::{Gender, HomeType, Pet, Species};
use crate::error::{MeshError, Result, ValidationErrors};
use serde::Deserialize;
use std::str::FromStr;

pub const MAX_PET_AGE: i64 = 30;

const APPLICANT_NAME_LEN: (usize, usize) = (2, 100);
const PHONE_LEN: (usize, usize) = (7, 20);
const REASON_LEN: (usize, usize) = (10, 1000);

/// New pet as submitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PetForm {
    pub name: String,
    pub species: String,
    pub breed: String,
    pub age: i64,
    pub gender: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub health_status: Option<String>,
}

/// Partial update to a pet. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PetPatch {
    pub name: Option<String>,
    pub species: Option<String>,
    pub breed: Option<String>,
    pub age: Option<i64>,
    pub gender: Option<String>,
    pub description: Option<String>,
    pub health_status: Option<String>,
}

impl PetPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.species.is_none()
            && self.breed.is_none()
            && self.age.is_none()
            && self.gender.is_none()
            && self.description.is_none()
            && self.health_status.is_none()
    }
}

/// Adoption application as submitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplicationForm {
    pub applicant_name: String,
    pub applicant_email: String,
    pub applicant_phone: String,
    #[serde(default)]
    pub has_experience: bool,
    #[serde(default)]
    pub has_other_pets: bool,
    pub home_type: String,
    pub reason: String,
}

/// Pet fields after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidPet {
    pub name: String,
    pub species: Species,
    pub breed: String,
    pub age: u8,
    pub gender: Gender,
    pub description: String,
    pub health_status: String,
}

/// Application fields after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidApplication {
    pub applicant_name: String,
    pub applicant_email: String,
    pub applicant_phone: String,
    pub has_experience: bool,
    pub has_other_pets: bool,
    pub home_type: HomeType,
    pub reason: String,
}

fn required(errors: &mut ValidationErrors, field: &'static str, value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        errors.push(field, "is required");
    }
    value.to_string()
}

fn parse_enum<T: FromStr>(errors: &mut ValidationErrors, field: &'static str, value: &str) -> Option<T> {
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) if value.trim().is_empty() => {
            errors.push(field, "is required");
            None
        }
        Err(_) => {
            errors.push(field, format!("invalid value '{}'", value.trim()));
            None
        }
    }
}

fn age(errors: &mut ValidationErrors, value: i64) -> Option<u8> {
    if (0..=MAX_PET_AGE).contains(&value) {
        Some(value as u8)
    } else {
        errors.push("age", format!("must be between 0 and {}", MAX_PET_AGE));
        None
    }
}

fn length(errors: &mut ValidationErrors, field: &'static str, value: &str, (min, max): (usize, usize)) -> String {
    let value = value.trim();
    let len = value.chars().count();
    if len < min || len > max {
        errors.push(field, format!("must be {} to {} characters", min, max));
    }
    value.to_string()
}

fn health_status(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => "Healthy".to_string(),
    }
}

pub fn validate_pet(form: &PetForm) -> Result<ValidPet> {
    let mut errors = ValidationErrors::new();
    let name = required(&mut errors, "name", &form.name);
    let species = parse_enum::<Species>(&mut errors, "species", &form.species);
    let breed = required(&mut errors, "breed", &form.breed);
    let age = age(&mut errors, form.age);
    let gender = parse_enum::<Gender>(&mut errors, "gender", &form.gender);

    errors.into_result()?;
    match (species, age, gender) {
        (Some(species), Some(age), Some(gender)) => Ok(ValidPet {
            name,
            species,
            breed,
            age,
            gender,
            description: form.description.trim().to_string(),
            health_status: health_status(form.health_status.as_deref()),
        }),
        _ => Err(MeshError::Internal("pet fields missing after validation".into())),
    }
}

/// Apply `patch` to a copy of `pet`, validating every field it sets.
///
/// Does not touch status or timestamps.
pub fn apply_patch(pet: &Pet, patch: &PetPatch) -> Result<Pet> {
    let mut errors = ValidationErrors::new();
    let mut next = pet.clone();

    if let Some(name) = &patch.name {
        next.name = required(&mut errors, "name", name);
    }
    if let Some(species) = &patch.species {
        if let Some(species) = parse_enum::<Species>(&mut errors, "species", species) {
            next.species = species;
        }
    }
    if let Some(breed) = &patch.breed {
        next.breed = required(&mut errors, "breed", breed);
    }
    if let Some(value) = patch.age {
        if let Some(value) = age(&mut errors, value) {
            next.age = value;
        }
    }
    if let Some(gender) = &patch.gender {
        if let Some(gender) = parse_enum::<Gender>(&mut errors, "gender", gender) {
            next.gender = gender;
        }
    }
    if let Some(description) = &patch.description {
        next.description = description.trim().to_string();
    }
    if let Some(status) = &patch.health_status {
        next.health_status = health_status(Some(status));
    }

    errors.into_result()?;
    Ok(next)
}

pub fn validate_application(form: &ApplicationForm) -> Result<ValidApplication> {
    let mut errors = ValidationErrors::new();
    let applicant_name = length(&mut errors, "applicant_name", &form.applicant_name, APPLICANT_NAME_LEN);
    let applicant_email = form.applicant_email.trim().to_string();
    if !applicant_email.contains('@') {
        errors.push("applicant_email", "must contain @");
    }
    let applicant_phone = length(&mut errors, "applicant_phone", &form.applicant_phone, PHONE_LEN);
    let home_type = parse_enum::<HomeType>(&mut errors, "home_type", &form.home_type);
    let reason = length(&mut errors, "reason", &form.reason, REASON_LEN);

    errors.into_result()?;
    let home_type = home_type
        .ok_or_else(|| MeshError::Internal("home_type missing after validation".into()))?;
    Ok(ValidApplication {
        applicant_name,
        applicant_email,
        applicant_phone,
        has_experience: form.has_experience,
        has_other_pets: form.has_other_pets,
        home_type,
        reason,
    })
}
