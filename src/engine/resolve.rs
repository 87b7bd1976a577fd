use crate::chain::{CallRequest, EventArgumentQuery, TransactionIntent, TransactionRequest};
use crate::error::{AnchorageError, DeclarationError};
use crate::graph::DeploymentGraph;
use crate::module::{
    AccountRef, ArgumentValue, DeploymentFuture, DeploymentParameters, FutureAction, FutureRef, Wei,
};
use crate::reconciler::ReconciledState;
use serde_json::Value;
use std::collections::BTreeMap;

/// A future's action with every reference replaced by a concrete value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResolvedAction {
    Transaction {
        sender: String,
        value: u128,
        intent: TransactionIntent,
    },
    StaticCall(CallRequest),
    /// `tx_hash` and `emitter` are filled from recorded results.
    ReadEvent(EventArgumentQuery),
    Bind { address: String },
}

impl ResolvedAction {
    pub(crate) fn request(sender: &str, nonce: u64, value: u128, intent: &TransactionIntent) -> TransactionRequest {
        TransactionRequest {
            from: sender.to_string(),
            nonce,
            value,
            intent: intent.clone(),
        }
    }
}

/// Reject a module whose inputs cannot be resolved for this deployment,
/// before the journal is touched.
pub(crate) fn check_inputs(
    graph: &DeploymentGraph,
    parameters: &DeploymentParameters,
    accounts: usize,
) -> Result<(), DeclarationError> {
    for future in graph.futures() {
        for parameter in future.parameters() {
            if parameters.resolve(parameter).is_none() {
                return Err(DeclarationError::MissingParameter {
                    module: parameter.module.clone(),
                    name: parameter.name.clone(),
                });
            }
        }
        if let Some(AccountRef(index)) = future
            .accounts()
            .into_iter()
            .find(|account| account.0 >= accounts)
        {
            return Err(DeclarationError::UnknownAccount {
                future: future.id.to_string(),
                index,
                available: accounts,
            });
        }
    }
    Ok(())
}

pub(crate) struct Resolver<'a> {
    pub state: &'a ReconciledState,
    pub parameters: &'a DeploymentParameters,
    pub accounts: &'a [String],
}

impl Resolver<'_> {
    pub(crate) fn resolve(&self, future: &DeploymentFuture) -> Result<ResolvedAction, AnchorageError> {
        let owner = future.id.to_string();
        Ok(match &future.action {
            FutureAction::DeployContract {
                contract,
                args,
                libraries,
                value,
                from,
            } => ResolvedAction::Transaction {
                sender: self.account(*from, &owner)?,
                value: value.map_or(0, |Wei(amount)| amount),
                intent: TransactionIntent::Deploy {
                    contract: contract.clone(),
                    args: self.values(args, &owner)?,
                    libraries: self.libraries(libraries, &owner)?,
                },
            },
            FutureAction::DeployLibrary {
                library,
                libraries,
                from,
            } => ResolvedAction::Transaction {
                sender: self.account(*from, &owner)?,
                value: 0,
                intent: TransactionIntent::Deploy {
                    contract: library.clone(),
                    args: Vec::new(),
                    libraries: self.libraries(libraries, &owner)?,
                },
            },
            FutureAction::ContractAt { address, .. } => match self.value(address, &owner)? {
                Value::String(address) => ResolvedAction::Bind { address },
                other => {
                    return Err(DeclarationError::InvalidFuture {
                        future: owner,
                        reason: format!("address must be a string, got {other}"),
                    }
                    .into());
                }
            },
            FutureAction::CallMethod {
                contract,
                method,
                args,
                value,
                from,
            } => ResolvedAction::Transaction {
                sender: self.account(*from, &owner)?,
                value: value.map_or(0, |Wei(amount)| amount),
                intent: TransactionIntent::Call {
                    to: self.address(contract, &owner)?,
                    method: method.clone(),
                    args: self.values(args, &owner)?,
                },
            },
            FutureAction::StaticCall {
                contract,
                method,
                args,
                output,
                from,
            } => ResolvedAction::StaticCall(CallRequest {
                from: from.map(|from| self.account(Some(from), &owner)).transpose()?,
                to: self.address(contract, &owner)?,
                method: method.clone(),
                args: self.values(args, &owner)?,
                output: output.clone(),
            }),
            FutureAction::ReadEventArgument {
                future: source,
                emitter,
                event,
                argument,
                event_index,
            } => {
                let tx_hash = self
                    .state
                    .result(source.id())
                    .and_then(|result| result.tx_hash.clone())
                    .ok_or_else(|| unresolved(&owner, source))?;
                ResolvedAction::ReadEvent(EventArgumentQuery {
                    tx_hash,
                    emitter: self.address(emitter, &owner)?,
                    event: event.clone(),
                    argument: argument.clone(),
                    event_index: *event_index,
                })
            }
            FutureAction::SendData {
                to,
                data,
                value,
                from,
            } => {
                let to = match self.value(to, &owner)? {
                    Value::String(to) => to,
                    other => {
                        return Err(DeclarationError::InvalidFuture {
                            future: owner,
                            reason: format!("recipient must be an address, got {other}"),
                        }
                        .into());
                    }
                };
                ResolvedAction::Transaction {
                    sender: self.account(*from, &owner)?,
                    value: value.map_or(0, |Wei(amount)| amount),
                    intent: TransactionIntent::Send {
                        to,
                        data: data.clone(),
                    },
                }
            }
        })
    }

    fn value(&self, argument: &ArgumentValue, owner: &str) -> Result<Value, AnchorageError> {
        Ok(match argument {
            ArgumentValue::Literal(value) => value.clone(),
            ArgumentValue::Future(reference) => self
                .state
                .result(reference.id())
                .and_then(crate::journal::FutureResult::as_argument)
                .ok_or_else(|| unresolved(owner, reference))?,
            ArgumentValue::Parameter(parameter) => {
                self.parameters
                    .resolve(parameter)
                    .ok_or_else(|| DeclarationError::MissingParameter {
                        module: parameter.module.clone(),
                        name: parameter.name.clone(),
                    })?
            }
            ArgumentValue::Account(account) => Value::String(self.account(Some(*account), owner)?),
            ArgumentValue::List(items) => Value::Array(self.values(items, owner)?),
        })
    }

    fn values(&self, arguments: &[ArgumentValue], owner: &str) -> Result<Vec<Value>, AnchorageError> {
        arguments
            .iter()
            .map(|argument| self.value(argument, owner))
            .collect()
    }

    fn address(&self, reference: &FutureRef, owner: &str) -> Result<String, AnchorageError> {
        self.state
            .result(reference.id())
            .and_then(|result| result.address.clone())
            .ok_or_else(|| unresolved(owner, reference))
    }

    fn libraries(
        &self,
        libraries: &BTreeMap<String, FutureRef>,
        owner: &str,
    ) -> Result<BTreeMap<String, String>, AnchorageError> {
        libraries
            .iter()
            .map(|(name, library)| Ok((name.clone(), self.address(library, owner)?)))
            .collect()
    }

    fn account(&self, account: Option<AccountRef>, owner: &str) -> Result<String, AnchorageError> {
        let AccountRef(index) = account.unwrap_or_default();
        self.accounts.get(index).cloned().ok_or_else(|| {
            DeclarationError::UnknownAccount {
                future: owner.to_string(),
                index,
                available: self.accounts.len(),
            }
            .into()
        })
    }
}

fn unresolved(owner: &str, reference: &FutureRef) -> AnchorageError {
    AnchorageError::UnresolvedResult {
        future: owner.to_string(),
        reference: reference.id().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::FutureResult;
    use crate::module::{
        CallOptions, ContractOptions, FutureId, ReadEventArgumentOptions, build_module,
    };
    use crate::reconciler::FutureStatus;
    use serde_json::json;

    fn graph() -> DeploymentGraph {
        let module = build_module("Nft", |m| {
            let owner = m.get_account(1);
            let name = m.get_parameter("name", Some(json!("Saturn V")));
            let nft = m.contract(
                "MyNFTCollection",
                [name, ArgumentValue::from(owner)],
                ContractOptions::default(),
            );
            let mint = m.call(&nft, "mint", [ArgumentValue::from(7_u64)], CallOptions::default());
            let minted =
                m.read_event_argument(&mint, "Transfer", "tokenId", ReadEventArgumentOptions {
                    emitter: Some(nft.clone()),
                    ..ReadEventArgumentOptions::default()
                });
            [("nft", nft), ("minted", minted)]
        })
        .unwrap();
        DeploymentGraph::build(&module).unwrap()
    }

    fn accounts() -> Vec<String> {
        vec!["0xa0".into(), "0xa1".into()]
    }

    #[test]
    fn constructor_arguments_resolve_parameters_and_accounts() {
        let graph = graph();
        let state = ReconciledState::new();
        let mut parameters = DeploymentParameters::new();
        parameters.insert("Nft", "name", json!("Apollo"));
        let accounts = accounts();
        let resolver = Resolver {
            state: &state,
            parameters: &parameters,
            accounts: &accounts,
        };

        let action = resolver.resolve(&graph.futures()[0]).unwrap();
        assert_eq!(
            action,
            ResolvedAction::Transaction {
                sender: "0xa0".into(),
                value: 0,
                intent: TransactionIntent::Deploy {
                    contract: "MyNFTCollection".into(),
                    args: vec![json!("Apollo"), json!("0xa1")],
                    libraries: BTreeMap::new(),
                },
            }
        );
    }

    #[test]
    fn missing_result_is_an_invariant_violation() {
        let graph = graph();
        let state = ReconciledState::new();
        let parameters = DeploymentParameters::new();
        let accounts = accounts();
        let resolver = Resolver {
            state: &state,
            parameters: &parameters,
            accounts: &accounts,
        };

        let err = resolver.resolve(&graph.futures()[1]).unwrap_err();
        assert!(matches!(
            err,
            AnchorageError::UnresolvedResult { ref reference, .. } if reference == "Nft#MyNFTCollection"
        ));
    }

    #[test]
    fn event_reads_use_recorded_hash_and_emitter() {
        let graph = graph();
        let mut state = ReconciledState::new();
        state.set(
            &FutureId::from("Nft#MyNFTCollection"),
            FutureStatus::Success(FutureResult::contract("0xc0ffee", Some("0x01".into()))),
        );
        state.set(
            &FutureId::from("Nft#MyNFTCollection.mint"),
            FutureStatus::Success(FutureResult::transaction("0x02")),
        );
        let parameters = DeploymentParameters::new();
        let accounts = accounts();
        let resolver = Resolver {
            state: &state,
            parameters: &parameters,
            accounts: &accounts,
        };

        let action = resolver.resolve(&graph.futures()[2]).unwrap();
        match action {
            ResolvedAction::ReadEvent(query) => {
                assert_eq!(query.tx_hash, "0x02");
                assert_eq!(query.emitter, "0xc0ffee");
                assert_eq!(query.event, "Transfer");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn input_check_reports_missing_parameters_and_accounts() {
        let module = build_module("Vault", |m| {
            let cap = m.get_parameter("cap", None);
            let vault = m.contract("Vault", [cap], ContractOptions::default());
            [("vault", vault)]
        })
        .unwrap();
        let graph = DeploymentGraph::build(&module).unwrap();

        let err = check_inputs(&graph, &DeploymentParameters::new(), 1).unwrap_err();
        assert_eq!(
            err,
            DeclarationError::MissingParameter {
                module: "Vault".into(),
                name: "cap".into(),
            }
        );

        let mut parameters = DeploymentParameters::new();
        parameters.insert("Vault", "cap", json!(100));
        assert!(check_inputs(&graph, &parameters, 1).is_ok());
        assert!(matches!(
            check_inputs(&graph, &parameters, 0),
            Err(DeclarationError::UnknownAccount { index: 0, available: 0, .. })
        ));
    }

    #[test]
    fn accounts_beyond_the_network_are_rejected() {
        let graph = graph();
        assert!(check_inputs(&graph, &DeploymentParameters::new(), 2).is_ok());
        assert!(matches!(
            check_inputs(&graph, &DeploymentParameters::new(), 1),
            Err(DeclarationError::UnknownAccount { index: 1, .. })
        ));
    }
}
