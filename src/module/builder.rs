use super::types::{
    AccountRef, ArgumentValue, CallOptions, ContractAtOptions, ContractOptions, DeploymentFuture,
    FutureAction, FutureId, FutureRef, LibraryOptions, Module, ParameterRef,
    ReadEventArgumentOptions, SendDataOptions, StaticCallOptions,
};
use crate::error::DeclarationError;
use std::collections::BTreeMap;

/// Collects the futures of one module without executing anything.
///
/// Declaration mistakes are deferred and reported by [`build_module`], so a
/// builder callback can be written as straight-line code.
#[derive(Debug)]
pub struct ModuleBuilder {
    id: String,
    futures: Vec<DeploymentFuture>,
    submodules: Vec<Module>,
    errors: Vec<DeclarationError>,
}

impl ModuleBuilder {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            futures: Vec::new(),
            submodules: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deploy `name` with the given constructor arguments.
    pub fn contract<A>(&mut self, name: &str, args: A, options: ContractOptions) -> FutureRef
    where
        A: IntoIterator<Item = ArgumentValue>,
    {
        let local = options.id.clone().unwrap_or_else(|| name.to_string());
        let action = FutureAction::DeployContract {
            contract: name.to_string(),
            args: args.into_iter().collect(),
            libraries: options.libraries,
            value: options.value,
            from: options.from,
        };
        self.push(&local, action, &options.after)
    }

    pub fn library(&mut self, name: &str, options: LibraryOptions) -> FutureRef {
        let local = options.id.clone().unwrap_or_else(|| name.to_string());
        let action = FutureAction::DeployLibrary {
            library: name.to_string(),
            libraries: options.libraries,
            from: options.from,
        };
        self.push(&local, action, &options.after)
    }

    /// Bind an already-deployed contract. Executes without a transaction.
    pub fn contract_at(
        &mut self,
        name: &str,
        address: impl Into<ArgumentValue>,
        options: ContractAtOptions,
    ) -> FutureRef {
        let local = options.id.clone().unwrap_or_else(|| name.to_string());
        let action = FutureAction::ContractAt {
            contract: name.to_string(),
            address: address.into(),
        };
        self.push(&local, action, &options.after)
    }

    pub fn call<A>(
        &mut self,
        contract: &FutureRef,
        method: &str,
        args: A,
        options: CallOptions,
    ) -> FutureRef
    where
        A: IntoIterator<Item = ArgumentValue>,
    {
        let local = options
            .id
            .clone()
            .unwrap_or_else(|| format!("{}.{method}", contract.id().local()));
        self.require_address(&local, contract);
        let action = FutureAction::CallMethod {
            contract: contract.clone(),
            method: method.to_string(),
            args: args.into_iter().collect(),
            value: options.value,
            from: options.from,
        };
        self.push(&local, action, &options.after)
    }

    pub fn static_call<A>(
        &mut self,
        contract: &FutureRef,
        method: &str,
        args: A,
        options: StaticCallOptions,
    ) -> FutureRef
    where
        A: IntoIterator<Item = ArgumentValue>,
    {
        let local = options
            .id
            .clone()
            .unwrap_or_else(|| format!("{}.{method}", contract.id().local()));
        self.require_address(&local, contract);
        let action = FutureAction::StaticCall {
            contract: contract.clone(),
            method: method.to_string(),
            args: args.into_iter().collect(),
            output: options.output,
            from: options.from,
        };
        self.push(&local, action, &options.after)
    }

    /// Read an argument of an event emitted by `future`'s transaction.
    pub fn read_event_argument(
        &mut self,
        future: &FutureRef,
        event: &str,
        argument: &str,
        options: ReadEventArgumentOptions,
    ) -> FutureRef {
        let emitter = options.emitter.clone().unwrap_or_else(|| future.clone());
        let local = options.id.clone().unwrap_or_else(|| {
            format!(
                "{}.{event}.{argument}.{}",
                emitter.id().local(),
                options.event_index
            )
        });
        if !future.kind().submits_transaction() {
            self.errors.push(DeclarationError::InvalidFuture {
                future: FutureId::new(&self.id, &local).to_string(),
                reason: format!("{} does not send a transaction that can emit events", future.id()),
            });
        }
        self.require_address(&local, &emitter);
        let action = FutureAction::ReadEventArgument {
            future: future.clone(),
            emitter,
            event: event.to_string(),
            argument: argument.to_string(),
            event_index: options.event_index,
        };
        self.push(&local, action, &options.after)
    }

    /// Send a raw transaction; `id` names the future since there is no
    /// contract or method to derive it from.
    pub fn send(
        &mut self,
        id: &str,
        to: impl Into<ArgumentValue>,
        options: SendDataOptions,
    ) -> FutureRef {
        let action = FutureAction::SendData {
            to: to.into(),
            data: options.data,
            value: options.value,
            from: options.from,
        };
        self.push(id, action, &options.after)
    }

    /// A value supplied at deploy time, falling back to `default`.
    pub fn get_parameter(
        &mut self,
        name: &str,
        default: Option<serde_json::Value>,
    ) -> ArgumentValue {
        self.check_identifier(name);
        ArgumentValue::Parameter(ParameterRef {
            module: self.id.clone(),
            name: name.to_string(),
            default,
        })
    }

    pub fn get_account(&self, index: usize) -> AccountRef {
        AccountRef(index)
    }

    /// Import another module's futures; returns its exports.
    pub fn use_module(&mut self, module: &Module) -> BTreeMap<String, FutureRef> {
        if module.id == self.id {
            self.errors
                .push(DeclarationError::CyclicDependency(vec![self.id.clone(), module.id.clone()]));
            return module.exports.clone();
        }
        match self.submodules.iter().find(|known| known.id == module.id) {
            Some(known) if known == module => {}
            Some(_) => self
                .errors
                .push(DeclarationError::DuplicateIdentifier(module.id.clone())),
            None => self.submodules.push(module.clone()),
        }
        module.exports.clone()
    }

    fn push(&mut self, local: &str, action: FutureAction, after: &[FutureRef]) -> FutureRef {
        self.check_identifier(local);
        let id = FutureId::new(&self.id, local);
        let kind = action.kind();
        self.futures
            .push(DeploymentFuture::new(id.clone(), action, after));
        FutureRef::new(id, kind)
    }

    fn require_address(&mut self, local: &str, target: &FutureRef) {
        if !target.kind().yields_address() {
            self.errors.push(DeclarationError::InvalidFuture {
                future: FutureId::new(&self.id, local).to_string(),
                reason: format!("{} ({}) does not resolve to a contract", target.id(), target.kind()),
            });
        }
    }

    fn check_identifier(&mut self, name: &str) {
        if !is_valid_identifier(name) {
            self.errors
                .push(DeclarationError::InvalidIdentifier(name.to_string()));
        }
    }
}

pub(crate) fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|ch| ch == '#' || ch == '/' || ch.is_whitespace())
}

/// Declare a module. The callback returns the exported handles.
pub fn build_module<F, I, K>(name: &str, define: F) -> Result<Module, DeclarationError>
where
    F: FnOnce(&mut ModuleBuilder) -> I,
    I: IntoIterator<Item = (K, FutureRef)>,
    K: Into<String>,
{
    if !is_valid_identifier(name) || name.contains('.') {
        return Err(DeclarationError::InvalidIdentifier(name.to_string()));
    }

    let mut builder = ModuleBuilder::new(name);
    let returned = define(&mut builder);

    let mut exports = BTreeMap::new();
    for (key, future) in returned {
        let key = key.into();
        if !is_valid_identifier(&key) {
            builder.errors.push(DeclarationError::InvalidIdentifier(key));
            continue;
        }
        if exports.insert(key.clone(), future).is_some() {
            builder
                .errors
                .push(DeclarationError::DuplicateIdentifier(format!("{name} export {key}")));
        }
    }

    if let Some(error) = builder.errors.into_iter().next() {
        return Err(error);
    }

    Ok(Module {
        id: builder.id,
        futures: builder.futures,
        exports,
        submodules: builder.submodules,
    })
}
