use std::str::FromStr;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::AppError;

pub const CALLER_ID_HEADER: &str = "x-caller-id";
pub const CALLER_ROLE_HEADER: &str = "x-caller-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Rider,
    Driver,
    Admin,
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rider" | "user" => Ok(Role::Rider),
            "driver" => Ok(Role::Driver),
            "admin" => Ok(Role::Admin),
            other => Err(AppError::Unauthorized(format!("unknown role: {other}"))),
        }
    }
}

/// Identity established by the upstream auth layer and forwarded as headers.
/// Requests without a well-formed identity never reach a handler.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins pass every role check.
    pub fn require(&self, role: Role) -> Result<(), AppError> {
        if self.role == role || self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!("{role:?} role required")))
        }
    }

    /// The caller is `owner` or an admin.
    pub fn require_self(&self, owner: Uuid) -> Result<(), AppError> {
        if self.id == owner || self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden("not allowed to act for another user".to_string()))
        }
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(format!("missing {name} header")))
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = Uuid::parse_str(header(parts, CALLER_ID_HEADER)?)
            .map_err(|_| AppError::Unauthorized(format!("malformed {CALLER_ID_HEADER} header")))?;
        let role = header(parts, CALLER_ROLE_HEADER)?.parse()?;

        Ok(Caller { id, role })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{Caller, Role};
    use crate::error::AppError;

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("Driver".parse::<Role>().unwrap(), Role::Driver);
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
        assert!(matches!("pilot".parse::<Role>(), Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn admin_passes_role_checks() {
        let admin = Caller {
            id: Uuid::new_v4(),
            role: Role::Admin,
        };
        let rider = Caller {
            id: Uuid::new_v4(),
            role: Role::Rider,
        };

        assert!(admin.require(Role::Driver).is_ok());
        assert!(matches!(rider.require(Role::Driver), Err(AppError::Forbidden(_))));
        assert!(rider.require_self(rider.id).is_ok());
        assert!(rider.require_self(Uuid::new_v4()).is_err());
    }
}
