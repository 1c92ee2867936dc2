//! Form fixtures.

use shelter_mesh::{ApplicationForm, PetForm};

pub fn pet_form(name: &str, species: &str) -> PetForm {
    PetForm {
        name: name.to_string(),
        species: species.to_string(),
        breed: "Mixed".to_string(),
        age: 3,
        gender: "Male".to_string(),
        description: String::new(),
        health_status: None,
    }
}

pub fn rex() -> PetForm {
    PetForm {
        breed: "Labrador".to_string(),
        description: "Friendly".to_string(),
        ..pet_form("Rex", "Dog")
    }
}

pub fn application_form(applicant: &str) -> ApplicationForm {
    ApplicationForm {
        applicant_name: applicant.to_string(),
        applicant_email: format!("{}@example.com", applicant.to_lowercase()),
        applicant_phone: "5551234".to_string(),
        has_experience: true,
        has_other_pets: false,
        home_type: "House".to_string(),
        reason: "I love dogs and have a yard".to_string(),
    }
}
