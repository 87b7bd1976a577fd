//! TOML module manifests.
//!
//! A manifest declares one or more modules with the same vocabulary as
//! [`ModuleBuilder`](super::ModuleBuilder):
//!
//! ```toml
//! [[module]]
//! name = "Tokens"
//!
//! [[module.future]]
//! type = "contract"
//! name = "Token"
//! args = [{ parameter = "supply", default = 1000 }]
//!
//! [[module.future]]
//! type = "call"
//! contract = "Token"
//! method = "mint"
//! args = [{ account = 0 }, 1000]
//!
//! [module.exports]
//! token = "Token"
//! ```
//!
//! References name a future declared earlier in the same module by its local
//! id, or an export of a module listed in `uses` as `Module#export`.

use super::builder::build_module;
use super::types::{
    AccountRef, ArgumentValue, CallOptions, ContractAtOptions, ContractOptions, FutureRef,
    LibraryOptions, Module, ReadEventArgumentOptions, SendDataOptions, StaticCallOptions, Wei,
};
use crate::error::DeclarationError;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestDocument {
    #[serde(default)]
    module: Vec<ManifestModule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestModule {
    name: String,
    #[serde(default)]
    uses: Vec<String>,
    #[serde(default)]
    future: Vec<ManifestFuture>,
    #[serde(default)]
    exports: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ManifestFuture {
    Contract {
        name: String,
        id: Option<String>,
        #[serde(default)]
        args: Vec<ManifestArg>,
        from: Option<usize>,
        value: Option<Wei>,
        #[serde(default)]
        libraries: BTreeMap<String, String>,
        #[serde(default)]
        after: Vec<String>,
    },
    Library {
        name: String,
        id: Option<String>,
        from: Option<usize>,
        #[serde(default)]
        libraries: BTreeMap<String, String>,
        #[serde(default)]
        after: Vec<String>,
    },
    ContractAt {
        name: String,
        id: Option<String>,
        address: ManifestArg,
        #[serde(default)]
        after: Vec<String>,
    },
    Call {
        contract: String,
        method: String,
        id: Option<String>,
        #[serde(default)]
        args: Vec<ManifestArg>,
        from: Option<usize>,
        value: Option<Wei>,
        #[serde(default)]
        after: Vec<String>,
    },
    StaticCall {
        contract: String,
        method: String,
        id: Option<String>,
        #[serde(default)]
        args: Vec<ManifestArg>,
        from: Option<usize>,
        output: Option<String>,
        #[serde(default)]
        after: Vec<String>,
    },
    ReadEventArgument {
        future: String,
        event: String,
        argument: String,
        id: Option<String>,
        emitter: Option<String>,
        #[serde(default)]
        event_index: usize,
        #[serde(default)]
        after: Vec<String>,
    },
    Send {
        id: String,
        to: ManifestArg,
        data: Option<String>,
        value: Option<Wei>,
        from: Option<usize>,
        #[serde(default)]
        after: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ManifestArg {
    Future {
        future: String,
    },
    Parameter {
        parameter: String,
        #[serde(default)]
        default: Option<serde_json::Value>,
    },
    Account {
        account: usize,
    },
    List(Vec<ManifestArg>),
    Literal(serde_json::Value),
}

/// Parse every module declared in a manifest, in declaration order.
pub fn parse_modules(raw: &str) -> Result<Vec<Module>, DeclarationError> {
    let document: ManifestDocument =
        toml::from_str(raw).map_err(|error| DeclarationError::Manifest(error.to_string()))?;
    if document.module.is_empty() {
        return Err(DeclarationError::Manifest("no [[module]] declared".into()));
    }

    let mut by_name: HashMap<&str, &ManifestModule> = HashMap::new();
    for module in &document.module {
        if by_name.insert(module.name.as_str(), module).is_some() {
            return Err(DeclarationError::DuplicateIdentifier(module.name.clone()));
        }
    }

    let order = import_order(&document.module, &by_name)?;
    let mut built: HashMap<String, Module> = HashMap::new();
    for name in order {
        let Some(manifest) = by_name.get(name.as_str()) else {
            continue;
        };
        let module = build_manifest_module(manifest, &built)?;
        built.insert(name, module);
    }

    Ok(document
        .module
        .iter()
        .filter_map(|module| built.remove(&module.name))
        .collect())
}

pub fn load_modules(path: &Path) -> Result<Vec<Module>, DeclarationError> {
    let raw = std::fs::read_to_string(path).map_err(|error| {
        DeclarationError::Manifest(format!("failed to read {}: {error}", path.display()))
    })?;
    parse_modules(&raw)
}

/// Load the module called `name`, or the last module in the file.
pub fn load_module(path: &Path, name: Option<&str>) -> Result<Module, DeclarationError> {
    let mut modules = load_modules(path)?;
    match name {
        Some(name) => modules
            .into_iter()
            .find(|module| module.id == name)
            .ok_or_else(|| DeclarationError::Manifest(format!("no module named {name}"))),
        None => modules
            .pop()
            .ok_or_else(|| DeclarationError::Manifest("no [[module]] declared".into())),
    }
}

/// Imported modules before importers; an import cycle is rejected.
fn import_order(
    modules: &[ManifestModule],
    by_name: &HashMap<&str, &ManifestModule>,
) -> Result<Vec<String>, DeclarationError> {
    let mut done: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = Vec::new();
    let mut order = Vec::new();

    for module in modules {
        visit_module(&module.name, by_name, &mut done, &mut stack, &mut order)?;
    }
    Ok(order)
}

fn visit_module(
    name: &str,
    by_name: &HashMap<&str, &ManifestModule>,
    done: &mut HashSet<String>,
    stack: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<(), DeclarationError> {
    if done.contains(name) {
        return Ok(());
    }
    if let Some(index) = stack.iter().position(|entry| entry == name) {
        let mut cycle = stack[index..].to_vec();
        cycle.push(name.to_string());
        return Err(DeclarationError::CyclicDependency(cycle));
    }

    stack.push(name.to_string());
    if let Some(module) = by_name.get(name) {
        for used in &module.uses {
            if !by_name.contains_key(used.as_str()) {
                return Err(DeclarationError::UnresolvedReference {
                    from: name.to_string(),
                    missing: used.clone(),
                });
            }
            visit_module(used, by_name, done, stack, order)?;
        }
    }
    stack.pop();

    done.insert(name.to_string());
    order.push(name.to_string());
    Ok(())
}

struct Scope<'a> {
    module: &'a str,
    locals: HashMap<String, FutureRef>,
    imports: HashMap<String, BTreeMap<String, FutureRef>>,
}

impl Scope<'_> {
    fn lookup(&self, from: &str, reference: &str) -> Result<FutureRef, DeclarationError> {
        let found = match reference.split_once('#') {
            Some((module, export)) => self
                .imports
                .get(module)
                .and_then(|exports| exports.get(export))
                .cloned(),
            None => self.locals.get(reference).cloned(),
        };
        found.ok_or_else(|| DeclarationError::UnresolvedReference {
            from: format!("{}#{from}", self.module),
            missing: reference.to_string(),
        })
    }

    fn lookup_all(&self, from: &str, references: &[String]) -> Result<Vec<FutureRef>, DeclarationError> {
        references
            .iter()
            .map(|reference| self.lookup(from, reference))
            .collect()
    }

    fn libraries(
        &self,
        from: &str,
        libraries: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, FutureRef>, DeclarationError> {
        libraries
            .iter()
            .map(|(name, reference)| Ok((name.clone(), self.lookup(from, reference)?)))
            .collect()
    }

    fn argument(
        &self,
        from: &str,
        arg: &ManifestArg,
        parameter: &mut dyn FnMut(&str, Option<serde_json::Value>) -> ArgumentValue,
    ) -> Result<ArgumentValue, DeclarationError> {
        Ok(match arg {
            ManifestArg::Future { future } => ArgumentValue::Future(self.lookup(from, future)?),
            ManifestArg::Parameter {
                parameter: name,
                default,
            } => parameter(name, default.clone()),
            ManifestArg::Account { account } => ArgumentValue::Account(AccountRef(*account)),
            ManifestArg::List(items) => ArgumentValue::List(
                items
                    .iter()
                    .map(|item| self.argument(from, item, &mut *parameter))
                    .collect::<Result<_, _>>()?,
            ),
            ManifestArg::Literal(value) => ArgumentValue::Literal(value.clone()),
        })
    }
}

fn build_manifest_module(
    manifest: &ManifestModule,
    built: &HashMap<String, Module>,
) -> Result<Module, DeclarationError> {
    let mut failure: Option<DeclarationError> = None;

    let module = build_module(&manifest.name, |m| {
        let mut scope = Scope {
            module: &manifest.name,
            locals: HashMap::new(),
            imports: HashMap::new(),
        };
        for used in &manifest.uses {
            if let Some(module) = built.get(used) {
                scope.imports.insert(used.clone(), m.use_module(module));
            }
        }

        for future in &manifest.future {
            match declare(m, &scope, future) {
                Ok(handle) => {
                    scope
                        .locals
                        .insert(handle.id().local().to_string(), handle);
                }
                Err(error) => {
                    failure = Some(error);
                    return Vec::new();
                }
            }
        }

        let mut exports = Vec::new();
        for (name, reference) in &manifest.exports {
            match scope.lookup(&format!("export {name}"), reference) {
                Ok(handle) => exports.push((name.clone(), handle)),
                Err(error) => {
                    failure = Some(error);
                    return Vec::new();
                }
            }
        }
        exports
    });

    match failure {
        Some(error) => Err(error),
        None => module,
    }
}

fn declare(
    m: &mut super::ModuleBuilder,
    scope: &Scope<'_>,
    future: &ManifestFuture,
) -> Result<FutureRef, DeclarationError> {
    let arguments = |label: &str, m: &mut super::ModuleBuilder, args: &[ManifestArg]| {
        args.iter()
            .map(|arg| {
                scope.argument(label, arg, &mut |name: &str, default| {
                    m.get_parameter(name, default)
                })
            })
            .collect::<Result<Vec<_>, _>>()
    };

    let handle = match future {
        ManifestFuture::Contract {
            name,
            id,
            args,
            from,
            value,
            libraries,
            after,
        } => {
            let label = id.as_deref().unwrap_or(name);
            let args = arguments(label, m, args)?;
            let options = ContractOptions {
                id: id.clone(),
                from: from.map(AccountRef),
                value: *value,
                libraries: scope.libraries(label, libraries)?,
                after: scope.lookup_all(label, after)?,
            };
            m.contract(name, args, options)
        }
        ManifestFuture::Library {
            name,
            id,
            from,
            libraries,
            after,
        } => {
            let label = id.as_deref().unwrap_or(name);
            let options = LibraryOptions {
                id: id.clone(),
                from: from.map(AccountRef),
                libraries: scope.libraries(label, libraries)?,
                after: scope.lookup_all(label, after)?,
            };
            m.library(name, options)
        }
        ManifestFuture::ContractAt {
            name,
            id,
            address,
            after,
        } => {
            let label = id.as_deref().unwrap_or(name);
            let address = arguments(label, m, std::slice::from_ref(address))?
                .pop()
                .unwrap_or(ArgumentValue::Literal(serde_json::Value::Null));
            let options = ContractAtOptions {
                id: id.clone(),
                after: scope.lookup_all(label, after)?,
            };
            m.contract_at(name, address, options)
        }
        ManifestFuture::Call {
            contract,
            method,
            id,
            args,
            from,
            value,
            after,
        } => {
            let label = id.clone().unwrap_or_else(|| format!("{contract}.{method}"));
            let target = scope.lookup(&label, contract)?;
            let args = arguments(&label, m, args)?;
            let options = CallOptions {
                id: id.clone(),
                from: from.map(AccountRef),
                value: *value,
                after: scope.lookup_all(&label, after)?,
            };
            m.call(&target, method, args, options)
        }
        ManifestFuture::StaticCall {
            contract,
            method,
            id,
            args,
            from,
            output,
            after,
        } => {
            let label = id.clone().unwrap_or_else(|| format!("{contract}.{method}"));
            let target = scope.lookup(&label, contract)?;
            let args = arguments(&label, m, args)?;
            let options = StaticCallOptions {
                id: id.clone(),
                from: from.map(AccountRef),
                output: output.clone(),
                after: scope.lookup_all(&label, after)?,
            };
            m.static_call(&target, method, args, options)
        }
        ManifestFuture::ReadEventArgument {
            future,
            event,
            argument,
            id,
            emitter,
            event_index,
            after,
        } => {
            let label = id
                .clone()
                .unwrap_or_else(|| format!("{future}.{event}.{argument}"));
            let source = scope.lookup(&label, future)?;
            let emitter = emitter
                .as_deref()
                .map(|emitter| scope.lookup(&label, emitter))
                .transpose()?;
            let options = ReadEventArgumentOptions {
                id: id.clone(),
                emitter,
                event_index: *event_index,
                after: scope.lookup_all(&label, after)?,
            };
            m.read_event_argument(&source, event, argument, options)
        }
        ManifestFuture::Send {
            id,
            to,
            data,
            value,
            from,
            after,
        } => {
            let to = arguments(id, m, std::slice::from_ref(to))?
                .pop()
                .unwrap_or(ArgumentValue::Literal(serde_json::Value::Null));
            let options = SendDataOptions {
                from: from.map(AccountRef),
                value: *value,
                data: data.clone(),
                after: scope.lookup_all(id, after)?,
            };
            m.send(id, to, options)
        }
    };
    Ok(handle)
}
