//! Call and Response messages.

use crate::error::ProtocolError;
use crate::SIGNATURE_SEPARATOR;
use bytes::Bytes;

/// A remote call issued by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Request id, unique within the lifetime of a connection.
    pub id: i64,
    /// Service the call is routed to.
    pub service: String,
    /// Method name handed to the service's handler.
    pub method: String,
    /// Opaque parameter payload (may be empty).
    pub param: Bytes,
}

impl Call {
    /// Creates a call, validating the service and method names.
    pub fn new(
        id: i64,
        service: impl Into<String>,
        method: impl Into<String>,
        param: impl Into<Bytes>,
    ) -> Result<Self, ProtocolError> {
        let service = service.into();
        let method = method.into();
        validate_service_name(&service)?;
        validate_method_name(&method)?;
        Ok(Self {
            id,
            service,
            method,
            param: param.into(),
        })
    }

    /// Creates a call from a `service.method` signature.
    pub fn from_signature(
        id: i64,
        signature: &str,
        param: impl Into<Bytes>,
    ) -> Result<Self, ProtocolError> {
        let (service, method) = parse_signature(signature)?;
        Self::new(id, service, method, param)
    }

    /// Returns the `service.method` signature of this call.
    pub fn signature(&self) -> String {
        format!("{}{}{}", self.service, SIGNATURE_SEPARATOR, self.method)
    }
}

/// The outcome of a call, addressed back to its request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Request id of the originating call.
    pub id: i64,
    /// Raw result bytes on success, error message on failure.
    pub outcome: Result<Bytes, String>,
}

impl Response {
    pub fn new(id: i64, outcome: Result<Bytes, String>) -> Self {
        Self { id, outcome }
    }

    /// Creates a success response.
    pub fn success(id: i64, result: impl Into<Bytes>) -> Self {
        Self {
            id,
            outcome: Ok(result.into()),
        }
    }

    /// Creates an error response.
    pub fn failure(id: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Err(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn into_outcome(self) -> Result<Bytes, String> {
        self.outcome
    }
}

/// Splits a `service.method` signature on its first separator.
///
/// The method part keeps any further separators, so `a.b.c` names method
/// `b.c` of service `a`.
pub fn parse_signature(signature: &str) -> Result<(&str, &str), ProtocolError> {
    let (service, method) = signature
        .split_once(SIGNATURE_SEPARATOR)
        .ok_or_else(|| ProtocolError::InvalidSignature(signature.to_string()))?;
    if service.is_empty() || method.is_empty() || signature.contains('\0') {
        return Err(ProtocolError::InvalidSignature(signature.to_string()));
    }
    Ok((service, method))
}

/// Checks that `name` can be used as a service name.
pub fn validate_service_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() || name.contains(SIGNATURE_SEPARATOR) || name.contains('\0') {
        return Err(ProtocolError::InvalidServiceName(name.to_string()));
    }
    Ok(())
}

/// Checks that `name` can be used as a method name.
pub fn validate_method_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() || name.contains('\0') {
        return Err(ProtocolError::InvalidMethodName(name.to_string()));
    }
    Ok(())
}
