//! Resolution of parameter sources across the whole model.
//!
//! A parameter gets its value from exactly one output or state. The edge is
//! either declared with [`Group::connect`](crate::Group::connect) or implied
//! when the parameter's promoted name equals an output's promoted name. This
//! module merges both kinds, attaches unit conversions to the targets and
//! decides which system schedules each transfer.

use std::collections::BTreeMap;

use crate::partition::common_ancestor;
use crate::units::{UnitError, UnitRegistry};
use crate::{Error, Result, VarMeta};

/// Target pathname to source pathname.
pub type ConnectionMap = BTreeMap<String, String>;

/// Everything derived from the connection graph during setup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Merged explicit and implicit connections
    pub connections: ConnectionMap,
    /// Parameters with no source, in declaration order
    pub hanging: Vec<String>,
    /// System pathname to the targets whose transfers it schedules
    pub owners: BTreeMap<String, Vec<String>>,
}

impl Resolution {
    /// Source feeding `target`, if any.
    pub fn source(&self, target: &str) -> Option<&str> {
        self.connections.get(target).map(String::as_str)
    }

    /// Targets whose transfers are scheduled by `system`.
    pub fn owned_by(&self, system: &str) -> &[String] {
        self.owners.get(system).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Connects parameters to outputs sharing their promoted name.
///
/// Fails when a promoted name is shared by more than one output.
pub fn implicit_connections(params: &[VarMeta], unknowns: &[VarMeta]) -> Result<ConnectionMap> {
    let mut outputs: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for meta in unknowns {
        outputs.entry(&meta.promoted_name).or_default().push(&meta.pathname);
    }

    if let Some((name, matches)) = outputs.iter().find(|(_, m)| m.len() > 1) {
        return Err(Error::AmbiguousPromotion {
            name: name.to_string(),
            matches: matches.iter().map(|m| m.to_string()).collect(),
        });
    }

    let connections = params
        .iter()
        .filter_map(|p| {
            outputs.get(p.promoted_name.as_str()).map(|src| (p.pathname.clone(), src[0].to_string()))
        })
        .collect();
    Ok(connections)
}

/// Resolves every parameter's source.
///
/// Explicit connections must not disagree with implicit ones; where both
/// exist and name the same source they are merged silently. Unit conversions
/// are recomputed on the parameter metadata, so resolving twice gives the
/// same result.
pub fn resolve(
    params: &mut [VarMeta],
    unknowns: &[VarMeta],
    explicit: &ConnectionMap,
    units: &UnitRegistry,
) -> Result<Resolution> {
    let implicit = implicit_connections(params, unknowns)?;

    for (target, source) in explicit {
        if let Some(other) = implicit.get(target) {
            if other != source {
                return Err(Error::ConnectionConflict {
                    target: target.clone(),
                    explicit: source.clone(),
                    implicit: other.clone(),
                });
            }
        }
    }

    let mut connections = implicit;
    connections.extend(explicit.iter().map(|(t, s)| (t.clone(), s.clone())));

    check_connections(&connections, params, unknowns)?;
    setup_units(&connections, params, unknowns, units)?;

    let hanging: Vec<String> = params
        .iter()
        .filter(|p| !connections.contains_key(&p.pathname))
        .map(|p| p.pathname.clone())
        .collect();
    if !hanging.is_empty() {
        log::warn!("Parameters {hanging:?} have no associated unknowns.");
    }

    let owners = assign_owners(&connections);
    log::debug!("resolved {} connections over {} systems", connections.len(), owners.len());

    Ok(Resolution { connections, hanging, owners })
}

fn check_connections(connections: &ConnectionMap, params: &[VarMeta], unknowns: &[VarMeta]) -> Result<()> {
    for (target, source) in connections {
        let invalid = |reason: String| Error::InvalidConnection {
            source_name: source.clone(),
            target: target.clone(),
            reason,
        };

        let tmeta = params.iter().find(|m| &m.pathname == target).ok_or_else(|| {
            invalid(format!("'{target}' is not a parameter"))
        })?;
        let smeta = unknowns.iter().find(|m| &m.pathname == source).ok_or_else(|| {
            invalid(format!("'{source}' is not an output or state"))
        })?;

        if tmeta.pass_by_obj != smeta.pass_by_obj {
            return Err(invalid("only one side is passed by object".to_string()));
        }
        if !tmeta.pass_by_obj && tmeta.size != smeta.size {
            return Err(invalid(format!(
                "source has size {} but target has size {}",
                smeta.size, tmeta.size
            )));
        }
    }
    Ok(())
}

/// Computes `(scale, offset)` for every connection with units on both ends.
///
/// Only non-identity conversions are stored on the target.
pub fn setup_units(
    connections: &ConnectionMap,
    params: &mut [VarMeta],
    unknowns: &[VarMeta],
    units: &UnitRegistry,
) -> Result<()> {
    for tmeta in params.iter_mut() {
        tmeta.unit_conv = None;

        let Some(source) = connections.get(&tmeta.pathname) else { continue };
        let Some(smeta) = unknowns.iter().find(|m| &m.pathname == source) else { continue };
        let (Some(src_units), Some(tgt_units)) = (&smeta.units, &tmeta.units) else { continue };

        let (scale, offset) = units.conversion(src_units, tgt_units).map_err(|err| match err {
            UnitError::Incompatible { .. } => Error::IncompatibleUnits {
                source_name: smeta.promoted_name.clone(),
                source_units: src_units.clone(),
                target_name: tmeta.promoted_name.clone(),
                target_units: tgt_units.clone(),
            },
            other => Error::Units(other),
        })?;

        if scale != 1.0 || offset != 0.0 {
            tmeta.unit_conv = Some((scale, offset));
        }
    }
    Ok(())
}

/// Groups targets under the lowest common ancestor of each connection.
pub fn assign_owners(connections: &ConnectionMap) -> BTreeMap<String, Vec<String>> {
    let mut owners: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (target, source) in connections {
        owners.entry(common_ancestor(target, source)).or_default().push(target.clone());
    }
    owners
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{VarKind, VarSpec, VariableRegistry};

    fn var(pathname: &str, promoted: &str, kind: VarKind, units: Option<&str>) -> VarMeta {
        let mut reg = VariableRegistry::new("");
        let mut spec = VarSpec::value(1.0);
        if let Some(u) = units {
            spec = spec.units(u);
        }
        match kind {
            VarKind::Param => reg.add_param("v", spec).unwrap(),
            VarKind::Output => reg.add_output("v", spec).unwrap(),
            VarKind::State => reg.add_state("v", spec).unwrap(),
        }
        let mut meta = reg.params().iter().chain(reg.unknowns()).next().unwrap().clone();
        meta.pathname = pathname.to_string();
        meta.promoted_name = promoted.to_string();
        meta
    }

    fn chain() -> (Vec<VarMeta>, Vec<VarMeta>) {
        let params = vec![
            var("c2:x", "x", VarKind::Param, None),
            var("c3:x", "c3:x", VarKind::Param, None),
        ];
        let unknowns = vec![var("c1:x", "x", VarKind::Output, None), var("c2:y", "y", VarKind::Output, None)];
        (params, unknowns)
    }

    #[test]
    fn test_implicit_by_promoted_name() {
        let (params, unknowns) = chain();
        let conns = implicit_connections(&params, &unknowns).unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns["c2:x"], "c1:x");
    }

    #[test]
    fn test_explicit_fills_gaps_and_hanging() {
        let (mut params, unknowns) = chain();
        let res = resolve(&mut params, &unknowns, &ConnectionMap::new(), &UnitRegistry::new()).unwrap();
        assert_eq!(res.hanging, vec!["c3:x"]);

        let explicit = ConnectionMap::from([("c3:x".to_string(), "c2:y".to_string())]);
        let res = resolve(&mut params, &unknowns, &explicit, &UnitRegistry::new()).unwrap();
        assert!(res.hanging.is_empty());
        assert_eq!(res.source("c3:x"), Some("c2:y"));
        assert_eq!(res.source("c2:x"), Some("c1:x"));
        assert_eq!(res.owned_by(""), ["c2:x", "c3:x"]);
    }

    #[test]
    fn test_conflict_names_both_sources() {
        let (mut params, unknowns) = chain();
        let explicit = ConnectionMap::from([("c2:x".to_string(), "c2:y".to_string())]);
        let err = resolve(&mut params, &unknowns, &explicit, &UnitRegistry::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "'c2:x' is explicitly connected to 'c2:y' but implicitly connected to 'c1:x'"
        );
    }

    #[test]
    fn test_matching_explicit_and_implicit_agree() {
        let (mut params, unknowns) = chain();
        let explicit = ConnectionMap::from([("c2:x".to_string(), "c1:x".to_string())]);
        let res = resolve(&mut params, &unknowns, &explicit, &UnitRegistry::new()).unwrap();
        assert_eq!(res.source("c2:x"), Some("c1:x"));
    }

    #[test]
    fn test_ambiguous_promotion() {
        let params = vec![var("c3:x", "x", VarKind::Param, None)];
        let unknowns = vec![var("c1:x", "x", VarKind::Output, None), var("c2:x", "x", VarKind::State, None)];
        let err = implicit_connections(&params, &unknowns).unwrap_err();
        assert!(matches!(err, Error::AmbiguousPromotion { ref name, ref matches }
            if name == "x" && matches == &["c1:x", "c2:x"]));
    }

    #[test]
    fn test_unit_conversions() {
        let mut units = UnitRegistry::new();
        units.define("degX", "K", 1.0, -32.0).unwrap();
        let unknowns = vec![
            var("src:t", "t", VarKind::Output, Some("K")),
            var("src:l", "l", VarKind::Output, Some("m")),
        ];
        let mut params = vec![
            var("a:t", "t", VarKind::Param, Some("degX")),
            var("b:t", "t", VarKind::Param, Some("K")),
            var("c:t", "t", VarKind::Param, None),
            var("d:l", "l", VarKind::Param, Some("cm")),
        ];

        resolve(&mut params, &unknowns, &ConnectionMap::new(), &units).unwrap();
        assert_eq!(params[0].unit_conv, Some((1.0, 32.0)));
        assert_eq!(params[1].unit_conv, None);
        assert_eq!(params[2].unit_conv, None);
        assert_eq!(params[3].unit_conv, Some((100.0, 0.0)));
    }

    #[test]
    fn test_incompatible_units_name_both_sides() {
        let unknowns = vec![var("src:l", "length", VarKind::Output, Some("m"))];
        let mut params = vec![var("tgt:l", "length", VarKind::Param, Some("s"))];
        let err = resolve(&mut params, &unknowns, &ConnectionMap::new(), &UnitRegistry::new()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'m'") && msg.contains("'s'"));
        assert!(matches!(err, Error::IncompatibleUnits { ref source_name, ref target_name, .. }
            if source_name == "length" && target_name == "length"));
    }

    #[test]
    fn test_invalid_explicit_endpoints() {
        let (mut params, unknowns) = chain();
        let explicit = ConnectionMap::from([("c3:x".to_string(), "c2:x".to_string())]);
        let err = resolve(&mut params, &unknowns, &explicit, &UnitRegistry::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidConnection { .. }));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let (mut params, unknowns) = chain();
        let explicit = ConnectionMap::from([("c3:x".to_string(), "c2:y".to_string())]);
        let first = resolve(&mut params, &unknowns, &explicit, &UnitRegistry::new()).unwrap();
        let second = resolve(&mut params, &unknowns, &explicit, &UnitRegistry::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_owners_by_common_ancestor() {
        let connections = ConnectionMap::from([
            ("g:c2:x".to_string(), "g:c1:y".to_string()),
            ("h:c3:x".to_string(), "g:c1:y".to_string()),
        ]);
        let owners = assign_owners(&connections);
        assert_eq!(owners["g"], vec!["g:c2:x"]);
        assert_eq!(owners[""], vec!["h:c3:x"]);
    }
}
