//! Business rules seam.
//!
//! A [`Validator`] knows the wire format of a work item. The pipeline has it
//! decode each item exactly once into an [`Inspection`], then asks that for
//! the transfer to check against the dependency, the rule verdict and an
//! optional presentation summary to broadcast.

use crate::dependency::TransferRequest;
use crate::event::{ProcessingResult, WorkItem};
use serde_json::Value;

/// Verdict of the validation rules for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    /// Code of the last failing rule, empty when valid
    pub code: String,
    pub message: String,
    /// Business reference found in the item, if any
    pub reference: Option<String>,
}

impl Validation {
    pub fn valid(message: impl Into<String>) -> Self {
        Self {
            valid: true,
            code: String::new(),
            message: message.into(),
            reference: None,
        }
    }

    pub fn invalid(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            valid: false,
            code: code.into(),
            message: message.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Record a failing rule. Later failures replace earlier ones.
    pub fn fail(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.valid = false;
        self.code = code.into();
        self.message = message.into();
    }
}

/// Item-format specific rules.
pub trait Validator: Send + Sync + 'static {
    /// Decode `item`. A payload that fails to decode still yields an
    /// inspection; it answers with the decode failure.
    fn inspect(&self, item: &WorkItem) -> Box<dyn Inspection>;
}

/// One decoded work item.
pub trait Inspection: Send + Sync {
    /// Transfer to check against the dependency.
    ///
    /// `Ok(None)` skips the dependency step; `Err` rejects the item outright
    /// with the given code.
    fn transfer(&self) -> Result<Option<TransferRequest>, Validation>;

    /// Run every rule. Rules do not short-circuit.
    fn validate(&self) -> Validation;

    /// Presentation summary broadcast instead of the raw result.
    fn summarize(&self, _result: &ProcessingResult) -> Option<Value> {
        None
    }
}

#[cfg(test)]
pub(crate) mod stubs {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Accepts everything; transfers a fixed amount from "debtor" to "creditor".
    pub struct AcceptAll;

    struct Accepted {
        reference: String,
    }

    impl Validator for AcceptAll {
        fn inspect(&self, item: &WorkItem) -> Box<dyn Inspection> {
            Box::new(Accepted {
                reference: item.id.clone(),
            })
        }
    }

    impl Inspection for Accepted {
        fn transfer(&self) -> Result<Option<TransferRequest>, Validation> {
            Ok(Some(TransferRequest {
                debtor: "debtor".into(),
                creditor: Some("creditor".into()),
                amount: 10.0,
                currency: "EUR".into(),
            }))
        }

        fn validate(&self) -> Validation {
            Validation::valid("ok").with_reference(self.reference.clone())
        }
    }

    /// Rejects payloads equal to `b"bad"` with `BAD_PAYLOAD`.
    pub struct RejectBad;

    struct Checked {
        bad: bool,
    }

    impl Validator for RejectBad {
        fn inspect(&self, item: &WorkItem) -> Box<dyn Inspection> {
            Box::new(Checked {
                bad: item.payload == b"bad",
            })
        }
    }

    impl Inspection for Checked {
        fn transfer(&self) -> Result<Option<TransferRequest>, Validation> {
            Ok(None)
        }

        fn validate(&self) -> Validation {
            if self.bad {
                Validation::invalid("BAD_PAYLOAD", "payload is bad")
            } else {
                Validation::valid("ok")
            }
        }
    }

    /// [`AcceptAll`] that counts how often items are decoded.
    #[derive(Default)]
    pub struct CountingDecodes {
        pub decodes: AtomicU32,
    }

    impl CountingDecodes {
        pub fn count(&self) -> u32 {
            self.decodes.load(Ordering::SeqCst)
        }
    }

    impl Validator for CountingDecodes {
        fn inspect(&self, item: &WorkItem) -> Box<dyn Inspection> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            AcceptAll.inspect(item)
        }
    }
}
