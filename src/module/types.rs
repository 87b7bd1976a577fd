use crate::error::DeclarationError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity of a future: `Module#Local`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FutureId(String);

impl FutureId {
    pub fn new(module: &str, local: &str) -> Self {
        Self(format!("{module}#{local}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn module(&self) -> &str {
        self.0.split_once('#').map_or("", |(module, _)| module)
    }

    pub fn local(&self) -> &str {
        self.0.split_once('#').map_or(self.0.as_str(), |(_, local)| local)
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FutureId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FutureKind {
    DeployContract,
    DeployLibrary,
    ContractAt,
    CallMethod,
    StaticCall,
    ReadEventArgument,
    SendData,
}

impl FutureKind {
    /// Futures whose result is a contract address.
    pub fn yields_address(self) -> bool {
        matches!(
            self,
            Self::DeployContract | Self::DeployLibrary | Self::ContractAt
        )
    }

    /// Futures that broadcast a transaction and consume a nonce.
    pub fn submits_transaction(self) -> bool {
        matches!(
            self,
            Self::DeployContract | Self::DeployLibrary | Self::CallMethod | Self::SendData
        )
    }
}

/// Handle standing in for a future's not-yet-known on-chain result.
///
/// A `FutureRef` only carries identity. There is no accessor for the value it
/// stands for: results are looked up by the engine at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FutureRef {
    id: FutureId,
    kind: FutureKind,
}

impl FutureRef {
    pub(crate) fn new(id: FutureId, kind: FutureKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> &FutureId {
        &self.id
    }

    pub fn kind(&self) -> FutureKind {
        self.kind
    }
}

/// Index into the signing accounts configured for the target network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountRef(pub usize);

/// Native-currency amount in the chain's smallest unit.
///
/// Serialized as a decimal string so journals and fingerprints never lose
/// precision on values above `u64::MAX`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Wei(pub u128);

impl Serialize for Wei {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Wei {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(Self(u128::from(value))),
            Raw::Text(text) => text
                .trim()
                .parse::<u128>()
                .map(Self)
                .map_err(|error| serde::de::Error::custom(format!("invalid amount {text:?}: {error}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRef {
    pub module: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// A constructor or method argument, resolved only at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgumentValue {
    Literal(serde_json::Value),
    Future(FutureRef),
    Parameter(ParameterRef),
    Account(AccountRef),
    List(Vec<ArgumentValue>),
}

impl ArgumentValue {
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<&'a FutureRef>) {
        match self {
            Self::Future(future) => out.push(future),
            Self::List(items) => items.iter().for_each(|item| item.collect_refs(out)),
            Self::Literal(_) | Self::Parameter(_) | Self::Account(_) => {}
        }
    }

    pub fn collect_parameters<'a>(&'a self, out: &mut Vec<&'a ParameterRef>) {
        match self {
            Self::Parameter(parameter) => out.push(parameter),
            Self::List(items) => items.iter().for_each(|item| item.collect_parameters(out)),
            Self::Literal(_) | Self::Future(_) | Self::Account(_) => {}
        }
    }

    pub fn collect_accounts(&self, out: &mut Vec<AccountRef>) {
        match self {
            Self::Account(account) => out.push(*account),
            Self::List(items) => items.iter().for_each(|item| item.collect_accounts(out)),
            Self::Literal(_) | Self::Future(_) | Self::Parameter(_) => {}
        }
    }
}

impl From<FutureRef> for ArgumentValue {
    fn from(value: FutureRef) -> Self {
        Self::Future(value)
    }
}

impl From<&FutureRef> for ArgumentValue {
    fn from(value: &FutureRef) -> Self {
        Self::Future(value.clone())
    }
}

impl From<AccountRef> for ArgumentValue {
    fn from(value: AccountRef) -> Self {
        Self::Account(value)
    }
}

impl From<ParameterRef> for ArgumentValue {
    fn from(value: ParameterRef) -> Self {
        Self::Parameter(value)
    }
}

impl From<serde_json::Value> for ArgumentValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for ArgumentValue {
    fn from(value: &str) -> Self {
        Self::Literal(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for ArgumentValue {
    fn from(value: String) -> Self {
        Self::Literal(serde_json::Value::String(value))
    }
}

impl From<u64> for ArgumentValue {
    fn from(value: u64) -> Self {
        Self::Literal(serde_json::Value::from(value))
    }
}

impl From<bool> for ArgumentValue {
    fn from(value: bool) -> Self {
        Self::Literal(serde_json::Value::Bool(value))
    }
}

impl From<Vec<ArgumentValue>> for ArgumentValue {
    fn from(value: Vec<ArgumentValue>) -> Self {
        Self::List(value)
    }
}

// ── Per-kind options ─────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ContractOptions {
    /// Local id override; defaults to the contract name.
    pub id: Option<String>,
    pub from: Option<AccountRef>,
    pub value: Option<Wei>,
    /// Library name → library future linked into the bytecode.
    pub libraries: BTreeMap<String, FutureRef>,
    /// Extra ordering-only dependencies.
    pub after: Vec<FutureRef>,
}

#[derive(Debug, Clone, Default)]
pub struct LibraryOptions {
    pub id: Option<String>,
    pub from: Option<AccountRef>,
    pub libraries: BTreeMap<String, FutureRef>,
    pub after: Vec<FutureRef>,
}

#[derive(Debug, Clone, Default)]
pub struct ContractAtOptions {
    pub id: Option<String>,
    pub after: Vec<FutureRef>,
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub id: Option<String>,
    pub from: Option<AccountRef>,
    pub value: Option<Wei>,
    pub after: Vec<FutureRef>,
}

#[derive(Debug, Clone, Default)]
pub struct StaticCallOptions {
    pub id: Option<String>,
    pub from: Option<AccountRef>,
    /// Named or positional return value to extract.
    pub output: Option<String>,
    pub after: Vec<FutureRef>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadEventArgumentOptions {
    pub id: Option<String>,
    /// Contract that emits the event, when it is not the future itself.
    pub emitter: Option<FutureRef>,
    pub event_index: usize,
    pub after: Vec<FutureRef>,
}

#[derive(Debug, Clone, Default)]
pub struct SendDataOptions {
    pub from: Option<AccountRef>,
    pub value: Option<Wei>,
    pub data: Option<String>,
    pub after: Vec<FutureRef>,
}

// ── Futures ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FutureAction {
    DeployContract {
        contract: String,
        args: Vec<ArgumentValue>,
        #[serde(default)]
        libraries: BTreeMap<String, FutureRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Wei>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<AccountRef>,
    },
    DeployLibrary {
        library: String,
        #[serde(default)]
        libraries: BTreeMap<String, FutureRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<AccountRef>,
    },
    ContractAt {
        contract: String,
        address: ArgumentValue,
    },
    CallMethod {
        contract: FutureRef,
        method: String,
        args: Vec<ArgumentValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Wei>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<AccountRef>,
    },
    StaticCall {
        contract: FutureRef,
        method: String,
        args: Vec<ArgumentValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<AccountRef>,
    },
    ReadEventArgument {
        /// Future whose transaction emitted the event.
        future: FutureRef,
        /// Contract that emitted it.
        emitter: FutureRef,
        event: String,
        argument: String,
        #[serde(default)]
        event_index: usize,
    },
    SendData {
        to: ArgumentValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Wei>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<AccountRef>,
    },
}

impl FutureAction {
    pub fn kind(&self) -> FutureKind {
        match self {
            Self::DeployContract { .. } => FutureKind::DeployContract,
            Self::DeployLibrary { .. } => FutureKind::DeployLibrary,
            Self::ContractAt { .. } => FutureKind::ContractAt,
            Self::CallMethod { .. } => FutureKind::CallMethod,
            Self::StaticCall { .. } => FutureKind::StaticCall,
            Self::ReadEventArgument { .. } => FutureKind::ReadEventArgument,
            Self::SendData { .. } => FutureKind::SendData,
        }
    }

    /// Every future this action reads a result from, in argument order.
    pub fn references(&self) -> Vec<&FutureRef> {
        let mut refs = Vec::new();
        match self {
            Self::DeployContract {
                args, libraries, ..
            } => {
                args.iter().for_each(|arg| arg.collect_refs(&mut refs));
                refs.extend(libraries.values());
            }
            Self::DeployLibrary { libraries, .. } => refs.extend(libraries.values()),
            Self::ContractAt { address, .. } => address.collect_refs(&mut refs),
            Self::CallMethod { contract, args, .. } | Self::StaticCall { contract, args, .. } => {
                refs.push(contract);
                args.iter().for_each(|arg| arg.collect_refs(&mut refs));
            }
            Self::ReadEventArgument {
                future, emitter, ..
            } => {
                refs.push(future);
                refs.push(emitter);
            }
            Self::SendData { to, .. } => to.collect_refs(&mut refs),
        }
        refs
    }

    fn arguments(&self) -> Vec<&ArgumentValue> {
        match self {
            Self::DeployContract { args, .. }
            | Self::CallMethod { args, .. }
            | Self::StaticCall { args, .. } => args.iter().collect(),
            Self::ContractAt { address, .. } => vec![address],
            Self::SendData { to, .. } => vec![to],
            Self::DeployLibrary { .. } | Self::ReadEventArgument { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentFuture {
    pub id: FutureId,
    pub action: FutureAction,
    /// Ordered dependency ids: result references first, then `after` edges.
    #[serde(default)]
    pub dependencies: Vec<FutureId>,
}

impl DeploymentFuture {
    pub fn new(id: FutureId, action: FutureAction, after: &[FutureRef]) -> Self {
        let mut dependencies: Vec<FutureId> = Vec::new();
        let refs = action.references();
        for id in refs.into_iter().map(FutureRef::id).chain(after.iter().map(FutureRef::id)) {
            if !dependencies.contains(id) {
                dependencies.push(id.clone());
            }
        }
        Self {
            id,
            action,
            dependencies,
        }
    }

    pub fn kind(&self) -> FutureKind {
        self.action.kind()
    }

    /// Dependency ids including any result reference missing from
    /// `dependencies`, deduplicated in declaration order.
    pub fn all_dependencies(&self) -> Vec<FutureId> {
        let mut all = self.dependencies.clone();
        for reference in self.action.references() {
            if !all.contains(reference.id()) {
                all.push(reference.id().clone());
            }
        }
        all
    }

    /// Account whose nonce this future consumes, if it sends a transaction.
    pub fn sender(&self) -> Option<AccountRef> {
        match &self.action {
            FutureAction::DeployContract { from, .. }
            | FutureAction::DeployLibrary { from, .. }
            | FutureAction::CallMethod { from, .. }
            | FutureAction::SendData { from, .. } => Some(from.unwrap_or_default()),
            FutureAction::ContractAt { .. }
            | FutureAction::StaticCall { .. }
            | FutureAction::ReadEventArgument { .. } => None,
        }
    }

    pub fn parameters(&self) -> Vec<&ParameterRef> {
        let mut parameters = Vec::new();
        for argument in self.action.arguments() {
            argument.collect_parameters(&mut parameters);
        }
        parameters
    }

    /// Every account index the future touches, as sender or argument.
    pub fn accounts(&self) -> Vec<AccountRef> {
        let mut accounts: Vec<AccountRef> = self.sender().into_iter().collect();
        if let FutureAction::StaticCall {
            from: Some(from), ..
        } = &self.action
        {
            accounts.push(*from);
        }
        for argument in self.action.arguments() {
            argument.collect_accounts(&mut accounts);
        }
        accounts
    }

    /// SHA-256 over the canonical JSON form of the action.
    pub fn fingerprint(&self) -> Result<String, DeclarationError> {
        let canonical = serde_json::to_vec(&self.action).map_err(|error| DeclarationError::InvalidFuture {
            future: self.id.to_string(),
            reason: format!("cannot be fingerprinted: {error}"),
        })?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: String,
    pub futures: Vec<DeploymentFuture>,
    #[serde(default)]
    pub exports: BTreeMap<String, FutureRef>,
    /// Modules pulled in with `use_module`, in first-use order.
    #[serde(default)]
    pub submodules: Vec<Module>,
}

impl Module {
    pub fn future(&self, id: &FutureId) -> Option<&DeploymentFuture> {
        self.futures.iter().find(|future| &future.id == id)
    }
}
