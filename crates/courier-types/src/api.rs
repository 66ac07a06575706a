use serde::{Deserialize, Serialize};

use crate::models::Identity;

/// JWT claims issued by the upstream auth service. Canonical definition
/// lives here so the WebSocket upgrade and the history route agree on the
/// shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Display name.
    pub name: String,
    #[serde(default)]
    pub admin: bool,
    pub exp: usize,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Identity {
            user_id: claims.sub,
            display_name: claims.name,
            is_admin: claims.admin,
        }
    }
}
