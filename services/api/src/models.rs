//! Request and response bodies of the REST API.

use personaverse_core::Persona;
use serde::{Deserialize, Serialize};

/// Body of `POST /probe`.
#[derive(Deserialize, Debug, Clone)]
pub struct ProbePayload {
    pub persona: Persona,
    pub prompt: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub message: String,
}
