// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pet and application lifecycle operations.
//!
//! Every operation is a read-modify-write sequence against the replicas.
//! Local mutations go through one async gate, so two local calls never
//! interleave, but remote deltas can still land between a read and the
//! write that follows it. Two shelters approving different applications
//! for the same pet within one gossip interval both succeed locally;
//! last-writer-wins then settles a single final state everywhere. Counter
//! increments have the same read-then-write race.

use super::model::{
    AdoptionApplication, AdoptionSummary, ApplicationStatus, Pet, PetFilter, PetStatus,
    ShelterStats,
};
use super::validation::{self, ApplicationForm, PetForm, PetPatch};
use crate::error::{MeshError, Result};
use crate::identity::ShelterIdentity;
use crate::metrics;
use crate::notify::{ChangeBus, ChangeEvent};
use crate::replica::ReplicaHandle;
use crate::topology::TopologyHandle;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const TOTAL_ADOPTIONS: &str = "total_adoptions";
pub const TOTAL_APPLICATIONS: &str = "total_applications";

const RECENT_ADOPTIONS: usize = 5;

/// Entry point for the UI layer.
pub struct ShelterService {
    identity: Arc<ShelterIdentity>,
    pets: ReplicaHandle<Pet>,
    applications: ReplicaHandle<AdoptionApplication>,
    counters: ReplicaHandle<i64>,
    topology: TopologyHandle,
    bus: ChangeBus,
    write_gate: Mutex<()>,
}

impl ShelterService {
    pub fn new(
        identity: Arc<ShelterIdentity>,
        pets: ReplicaHandle<Pet>,
        applications: ReplicaHandle<AdoptionApplication>,
        counters: ReplicaHandle<i64>,
        topology: TopologyHandle,
        bus: ChangeBus,
    ) -> Self {
        Self {
            identity,
            pets,
            applications,
            counters,
            topology,
            bus,
            write_gate: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &ShelterIdentity {
        &self.identity
    }

    /// Record the outcome of an operation. Domain failures are expected
    /// traffic and stay at debug.
    fn track<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(MeshError::Validation(_)) => "validation",
            Err(MeshError::NotFound { .. }) => "not_found",
            Err(e) if e.is_domain() => "rejected",
            Err(_) => "error",
        };
        if let Err(e) = &result {
            debug!(operation, error = %e, "Operation refused");
        }
        metrics::record_domain_op(operation, outcome);
        result
    }

    async fn increment(&self, key: &str) -> i64 {
        let next = self.counters.get(key).await.unwrap_or(0) + 1;
        self.counters.put(key, next).await;
        next
    }

    pub async fn counter(&self, key: &str) -> i64 {
        self.counters.get(key).await.unwrap_or(0)
    }

    // =========================================================================
    // Pets
    // =========================================================================

    pub async fn add_pet(&self, form: PetForm) -> Result<Pet> {
        let result = self.add_pet_inner(form).await;
        self.track("add_pet", result)
    }

    async fn add_pet_inner(&self, form: PetForm) -> Result<Pet> {
        let valid = validation::validate_pet(&form)?;
        let _gate = self.write_gate.lock().await;

        let now = Utc::now();
        let pet = Pet {
            id: self.identity.new_record_id(),
            name: valid.name,
            species: valid.species,
            breed: valid.breed,
            age: valid.age,
            gender: valid.gender,
            description: valid.description,
            health_status: valid.health_status,
            status: PetStatus::Available,
            shelter_id: self.identity.shelter_id().to_string(),
            shelter_name: self.identity.shelter_name().to_string(),
            created_at: now,
            updated_at: now,
            adopted_by: None,
            adopted_at: None,
            removal_reason: None,
        };
        self.pets.put(pet.id.clone(), pet.clone()).await;
        info!(pet_id = %pet.id, name = %pet.name, "Pet added");
        self.bus.publish(ChangeEvent::PetAdded { pet: pet.clone() });
        Ok(pet)
    }

    pub async fn update_pet(&self, id: &str, patch: PetPatch) -> Result<Pet> {
        let result = self.update_pet_inner(id, patch).await;
        self.track("update_pet", result)
    }

    async fn update_pet_inner(&self, id: &str, patch: PetPatch) -> Result<Pet> {
        let _gate = self.write_gate.lock().await;
        let pet = self.require_pet(id).await?;
        if pet.status.is_terminal() {
            return Err(not_available(&pet));
        }

        let mut updated = validation::apply_patch(&pet, &patch)?;
        updated.updated_at = Utc::now();
        self.pets.put(updated.id.clone(), updated.clone()).await;
        debug!(pet_id = %updated.id, "Pet updated");
        self.bus.publish(ChangeEvent::PetUpdated {
            pet: updated.clone(),
        });
        Ok(updated)
    }

    /// Irreversible.
    pub async fn remove_pet(&self, id: &str, reason: &str) -> Result<Pet> {
        let result = self.remove_pet_inner(id, reason).await;
        self.track("remove_pet", result)
    }

    async fn remove_pet_inner(&self, id: &str, reason: &str) -> Result<Pet> {
        let _gate = self.write_gate.lock().await;
        let mut pet = self.require_pet(id).await?;
        if pet.status.is_terminal() {
            return Err(not_available(&pet));
        }

        let reason = reason.trim();
        pet.status = PetStatus::Removed;
        pet.removal_reason = (!reason.is_empty()).then(|| reason.to_string());
        pet.updated_at = Utc::now();
        self.pets.put(pet.id.clone(), pet.clone()).await;
        info!(pet_id = %pet.id, reason = %reason, "Pet removed");
        self.bus.publish(ChangeEvent::PetRemoved { pet: pet.clone() });
        Ok(pet)
    }

    async fn require_pet(&self, id: &str) -> Result<Pet> {
        self.pets
            .get(id)
            .await
            .ok_or_else(|| MeshError::not_found("Pet", id))
    }

    // =========================================================================
    // Applications
    // =========================================================================

    pub async fn submit_application(
        &self,
        pet_id: &str,
        form: ApplicationForm,
    ) -> Result<AdoptionApplication> {
        let result = self.submit_application_inner(pet_id, form).await;
        self.track("submit_application", result)
    }

    async fn submit_application_inner(
        &self,
        pet_id: &str,
        form: ApplicationForm,
    ) -> Result<AdoptionApplication> {
        let _gate = self.write_gate.lock().await;
        let pet = self.require_pet(pet_id).await?;
        if pet.status != PetStatus::Available {
            return Err(not_available(&pet));
        }
        let valid = validation::validate_application(&form)?;

        let application = AdoptionApplication {
            id: self.identity.new_record_id(),
            pet_id: pet.id.clone(),
            applicant_name: valid.applicant_name,
            applicant_email: valid.applicant_email,
            applicant_phone: valid.applicant_phone,
            has_experience: valid.has_experience,
            has_other_pets: valid.has_other_pets,
            home_type: valid.home_type,
            reason: valid.reason,
            status: ApplicationStatus::Pending,
            submitted_at: Utc::now(),
            reviewed_by: None,
            reviewed_at: None,
            shelter_id: self.identity.shelter_id().to_string(),
        };
        self.applications
            .put(application.id.clone(), application.clone())
            .await;
        self.increment(TOTAL_APPLICATIONS).await;
        info!(application_id = %application.id, pet_id = %pet.id, "Application submitted");
        self.bus.publish(ChangeEvent::ApplicationSubmitted {
            application: application.clone(),
        });
        Ok(application)
    }

    /// Approve one application, adopt the pet and reject every other
    /// pending application for it.
    pub async fn approve_adoption(
        &self,
        pet_id: &str,
        application_id: &str,
    ) -> Result<(Pet, AdoptionApplication)> {
        let result = self.approve_adoption_inner(pet_id, application_id).await;
        self.track("approve_adoption", result)
    }

    async fn approve_adoption_inner(
        &self,
        pet_id: &str,
        application_id: &str,
    ) -> Result<(Pet, AdoptionApplication)> {
        let cannot = |reason: String| MeshError::CannotApprove {
            pet_id: pet_id.to_string(),
            application_id: application_id.to_string(),
            reason,
        };

        let _gate = self.write_gate.lock().await;
        let mut pet = self
            .pets
            .get(pet_id)
            .await
            .ok_or_else(|| cannot("pet not found".into()))?;
        let mut application = self
            .applications
            .get(application_id)
            .await
            .ok_or_else(|| cannot("application not found".into()))?;
        if application.pet_id != pet.id {
            return Err(cannot("application is for another pet".into()));
        }
        if pet.status != PetStatus::Available {
            return Err(cannot(format!("pet is {}", pet.status)));
        }
        if application.status != ApplicationStatus::Pending {
            return Err(cannot(format!("application is {}", application.status)));
        }

        let now = Utc::now();
        let reviewer = self.identity.shelter_name().to_string();

        pet.status = PetStatus::Adopted;
        pet.adopted_by = Some(application.applicant_name.clone());
        pet.adopted_at = Some(now);
        pet.updated_at = now;

        application.status = ApplicationStatus::Approved;
        application.reviewed_by = Some(reviewer.clone());
        application.reviewed_at = Some(now);

        self.pets.put(pet.id.clone(), pet.clone()).await;
        self.applications
            .put(application.id.clone(), application.clone())
            .await;
        self.increment(TOTAL_ADOPTIONS).await;

        let competing: Vec<AdoptionApplication> = self
            .applications
            .snapshot()
            .await
            .into_values()
            .filter(|other| {
                other.pet_id == pet.id
                    && other.id != application.id
                    && other.status == ApplicationStatus::Pending
            })
            .collect();
        let rejected = competing.len();
        for mut other in competing {
            other.status = ApplicationStatus::Rejected;
            other.reviewed_by = Some(reviewer.clone());
            other.reviewed_at = Some(now);
            self.applications.put(other.id.clone(), other).await;
        }

        info!(
            pet_id = %pet.id,
            application_id = %application.id,
            rejected,
            "Adoption approved"
        );
        self.bus.publish(ChangeEvent::PetAdopted {
            pet: pet.clone(),
            application: application.clone(),
        });
        Ok((pet, application))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get_pet(&self, id: &str) -> Option<Pet> {
        self.pets.get(id).await
    }

    /// Newest first.
    pub async fn list_pets(&self, filter: PetFilter) -> Vec<Pet> {
        let mut pets: Vec<Pet> = self
            .pets
            .snapshot()
            .await
            .into_values()
            .filter(|pet| filter.matches(pet))
            .collect();
        pets.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        pets
    }

    /// Applications for one pet, newest first.
    pub async fn get_applications(&self, pet_id: &str) -> Vec<AdoptionApplication> {
        let mut applications: Vec<AdoptionApplication> = self
            .applications
            .snapshot()
            .await
            .into_values()
            .filter(|app| app.pet_id == pet_id)
            .collect();
        applications.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        applications
    }

    pub async fn get_application(&self, id: &str) -> Option<AdoptionApplication> {
        self.applications.get(id).await
    }

    /// Computed fresh from the replicas on every call.
    pub async fn get_stats(&self) -> ShelterStats {
        let pets = self.pets.snapshot().await;
        let applications = self.applications.snapshot().await;
        let counters = self.counters.snapshot().await;

        let mut stats = ShelterStats {
            total_pets: pets.len(),
            total_applications: counters.get(TOTAL_APPLICATIONS).copied().unwrap_or(0),
            total_adoptions: counters.get(TOTAL_ADOPTIONS).copied().unwrap_or(0),
            connected_peers: self.topology.connected_count().await,
            ..Default::default()
        };

        let mut breakdown = BTreeMap::new();
        for pet in pets.values() {
            match pet.status {
                PetStatus::Available => {
                    stats.available += 1;
                    *breakdown.entry(pet.species).or_insert(0) += 1;
                }
                PetStatus::Adopted => stats.adopted += 1,
                PetStatus::Removed => stats.removed += 1,
            }
        }
        stats.species_breakdown = breakdown;
        stats.pending_applications = applications
            .values()
            .filter(|app| app.status == ApplicationStatus::Pending)
            .count();

        let mut adopted: Vec<&Pet> = pets
            .values()
            .filter(|pet| pet.status == PetStatus::Adopted)
            .collect();
        adopted.sort_by(|a, b| b.adopted_at.cmp(&a.adopted_at));
        stats.recent_adoptions = adopted
            .into_iter()
            .take(RECENT_ADOPTIONS)
            .map(|pet| AdoptionSummary {
                pet_id: pet.id.clone(),
                pet_name: pet.name.clone(),
                species: pet.species,
                adopted_by: pet.adopted_by.clone(),
                adopted_at: pet.adopted_at,
            })
            .collect();

        stats
    }
}

fn not_available(pet: &Pet) -> MeshError {
    MeshError::PetNotAvailable {
        pet_id: pet.id.clone(),
        status: pet.status.to_string(),
    }
}
