//! Aggregate trait and the recorded-event fold used by command dispatch.

use serde::{Serialize, de::DeserializeOwned};

use crate::event::{ProposedEvent, RecordedEvent};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the
/// [`apply`](Aggregate::apply) method.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no
///   I/O, no side effects. It validates a command against the current
///   state and returns zero or more events.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes
///   ownership of the current state and a reference to a domain event,
///   returning the next state. Unknown event variants should be ignored
///   for forward compatibility.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "account"). Prefixes the
    /// stream id of every instance.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    ///
    /// Must use adjacently tagged serde (`#[serde(tag = "type", content =
    /// "data")]`): the tag becomes the recorded `event_type` and the
    /// content becomes the payload.
    type DomainEvent: Serialize + DeserializeOwned + std::fmt::Debug + Send + Sync + Clone + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    /// Returns `Err` to reject the command.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// The stream id for an aggregate instance: `"{type}-{instance_id}"`.
pub fn stream_id<A: Aggregate>(instance_id: &str) -> String {
    format!("{}-{instance_id}", A::AGGREGATE_TYPE)
}

/// Decode a recorded event back into `A`'s domain event.
///
/// Reconstructs the adjacently tagged JSON object from the recorded
/// `event_type` and payload. Returns `None` for unknown or malformed
/// events so folds stay forward compatible.
pub fn decode_domain_event<A: Aggregate>(event: &RecordedEvent) -> Option<A::DomainEvent> {
    let tagged = if event.payload.is_null() {
        serde_json::json!({ "type": event.event_type })
    } else {
        serde_json::json!({ "type": event.event_type, "data": event.payload })
    };
    serde_json::from_value(tagged).ok()
}

/// Fold a recorded stream into aggregate state, skipping unknown events.
pub fn fold<A: Aggregate>(events: &[RecordedEvent]) -> A {
    events.iter().fold(A::default(), |state, event| {
        match decode_domain_event::<A>(event) {
            Some(domain_event) => state.apply(&domain_event),
            None => state,
        }
    })
}

/// Encode a domain event into a [`ProposedEvent`] ready for append.
///
/// The adjacently tagged `"type"` field becomes the event type; the
/// `"data"` field (absent for unit variants) becomes the payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the domain event cannot be serialized or
/// does not use adjacently tagged serialization.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
) -> serde_json::Result<ProposedEvent> {
    use serde::de::Error;

    let value = serde_json::to_value(event)?;
    let object = value
        .as_object()
        .ok_or_else(|| serde_json::Error::custom("domain event must serialize to a JSON object"))?;
    let event_type = object
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| serde_json::Error::custom("domain event must have a string \"type\" tag"))?;
    let payload = object.get("data").cloned().unwrap_or(serde_json::Value::Null);

    Ok(ProposedEvent::new(event_type, payload))
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use serde::{Deserialize, Serialize};

    use super::Aggregate;

    /// Lifecycle of a bank account fixture.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum AccountState {
        #[default]
        Pending,
        Active,
    }

    /// Bank account aggregate used by the end-to-end scenarios.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Account {
        pub account_number: Option<String>,
        pub balance: i64,
        pub state: AccountState,
    }

    #[derive(Debug, Clone)]
    pub(crate) enum AccountCommand {
        Open {
            account_number: String,
            initial_balance: i64,
        },
        Deposit {
            amount: i64,
        },
        Withdraw {
            amount: i64,
        },
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum AccountEvent {
        BankAccountOpened {
            account_number: String,
            initial_balance: i64,
        },
        MoneyDeposited {
            amount: i64,
            balance: i64,
        },
        MoneyWithdrawn {
            amount: i64,
            balance: i64,
        },
    }

    #[derive(Debug, thiserror::Error)]
    pub(crate) enum AccountError {
        #[error("account is already open")]
        AlreadyOpened,
        #[error("account is not open")]
        NotOpened,
        #[error("insufficient funds: balance {balance}, requested {requested}")]
        InsufficientFunds { balance: i64, requested: i64 },
    }

    impl Aggregate for Account {
        const AGGREGATE_TYPE: &'static str = "account";

        type Command = AccountCommand;
        type DomainEvent = AccountEvent;
        type Error = AccountError;

        fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error> {
            match cmd {
                AccountCommand::Open {
                    account_number,
                    initial_balance,
                } => {
                    if self.state == AccountState::Active {
                        return Err(AccountError::AlreadyOpened);
                    }
                    Ok(vec![AccountEvent::BankAccountOpened {
                        account_number,
                        initial_balance,
                    }])
                }
                AccountCommand::Deposit { amount } => {
                    if self.state != AccountState::Active {
                        return Err(AccountError::NotOpened);
                    }
                    Ok(vec![AccountEvent::MoneyDeposited {
                        amount,
                        balance: self.balance + amount,
                    }])
                }
                AccountCommand::Withdraw { amount } => {
                    if self.state != AccountState::Active {
                        return Err(AccountError::NotOpened);
                    }
                    if amount > self.balance {
                        return Err(AccountError::InsufficientFunds {
                            balance: self.balance,
                            requested: amount,
                        });
                    }
                    Ok(vec![AccountEvent::MoneyWithdrawn {
                        amount,
                        balance: self.balance - amount,
                    }])
                }
            }
        }

        fn apply(mut self, event: &Self::DomainEvent) -> Self {
            match event {
                AccountEvent::BankAccountOpened {
                    account_number,
                    initial_balance,
                } => {
                    self.account_number = Some(account_number.clone());
                    self.balance = *initial_balance;
                    self.state = AccountState::Active;
                }
                AccountEvent::MoneyDeposited { balance, .. }
                | AccountEvent::MoneyWithdrawn { balance, .. } => {
                    self.balance = *balance;
                }
            }
            self
        }
    }
}
