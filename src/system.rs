//! Model tree construction and the flattened model.
//!
//! A [`Group`] is a builder: it owns its children and the connections declared
//! in its scope. [`Model::build`] flattens the tree depth first into an arena
//! of [`Node`]s, resolves connections, allocates the flat vectors and hands
//! every active component a window onto them.
//!
//! The model then provides the global operations the solvers are written
//! against: sequential execution, residual evaluation, linearization and the
//! product with the global linear operator `A = -dR/du`.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::ops::Range;
use std::rc::Rc;

use crate::component::{Component, Jacobian, LinearContext, LinearMode};
use crate::connections::{resolve, ConnectionMap, Resolution};
use crate::finite_difference::{unit_fd_jacobian, FdOptions, UnitPoint};
use crate::partition::Partition;
use crate::units::UnitRegistry;
use crate::vector::{Layout, ObjectStore, VecView, VecViewMut, Vectors};
use crate::{join_path, Error, Result, Value, VarMeta, VariableRegistry, SEPARATOR};

enum Child {
    Component(Box<dyn Component>),
    Group(Group),
}

/// A node of the model tree under construction.
///
/// # Examples
///
/// ```
/// use plexus::components::{IndepVarComp, Paraboloid};
/// use plexus::Group;
///
/// let mut sub = Group::new();
/// sub.add("parab", Paraboloid::new(), &["*"]);
///
/// let mut root = Group::new();
/// root.add("px", IndepVarComp::new("x", 1.0), &[]);
/// root.add("py", IndepVarComp::new("y", 2.0), &["y"]);
/// root.add_group("sub", sub, &["y", "f_xy"]);
/// root.connect("px:x", "sub:x");
/// ```
#[derive(Default)]
pub struct Group {
    children: Vec<(String, Child, Vec<String>)>,
    connections: Vec<(String, String)>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a component. `promotes` lists variable names, or `*` globs, that
    /// keep their name in this group's scope.
    pub fn add<C: Component + 'static>(&mut self, name: &str, component: C, promotes: &[&str]) -> &mut Self {
        let promotes = promotes.iter().map(|p| p.to_string()).collect();
        self.children.push((name.to_string(), Child::Component(Box::new(component)), promotes));
        self
    }

    /// Adds a subgroup.
    pub fn add_group(&mut self, name: &str, group: Group, promotes: &[&str]) -> &mut Self {
        let promotes = promotes.iter().map(|p| p.to_string()).collect();
        self.children.push((name.to_string(), Child::Group(group), promotes));
        self
    }

    /// Connects an output or state to parameters, both named in this group's scope.
    pub fn connect(&mut self, source: &str, target: &str) -> &mut Self {
        self.connections.push((source.to_string(), target.to_string()));
        self
    }
}

/// Glob match supporting `*` only.
fn glob_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((head, tail)) => {
            let Some(rest) = name.strip_prefix(head) else { return false };
            if tail.is_empty() {
                return true;
            }
            (0..=rest.len()).filter(|&i| rest.is_char_boundary(i)).any(|i| glob_match(tail, &rest[i..]))
        }
    }
}

/// Where a component's cached Jacobian came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianSource {
    /// Blocks returned by `linearize`
    Analytic,
    /// Blocks computed by finite differences
    FiniteDifference,
    /// No blocks; the component applies its own product
    Custom,
}

/// Per-component state held by the model.
pub struct UnitSlot {
    pub(crate) component: Box<dyn Component>,
    pub(crate) registry: VariableRegistry,
    pub(crate) jacobian: Option<Jacobian>,
    pub(crate) jacobian_source: Option<JacobianSource>,
    pub(crate) u_layout: Layout,
    pub(crate) p_layout: Layout,
    pub(crate) u_range: Range<usize>,
    pub(crate) p_range: Range<usize>,
    pub(crate) u_objects: ObjectStore,
    pub(crate) p_objects: ObjectStore,
}

impl UnitSlot {
    pub fn registry(&self) -> &VariableRegistry {
        &self.registry
    }

    /// Blocks cached by the last linearization.
    pub fn jacobian(&self) -> Option<&Jacobian> {
        self.jacobian.as_ref()
    }

    pub fn jacobian_source(&self) -> Option<JacobianSource> {
        self.jacobian_source
    }

    pub fn fd_options(&self) -> FdOptions {
        self.component.fd_options()
    }

    /// Unknowns layout, keyed by local name.
    pub fn u_layout(&self) -> &Layout {
        &self.u_layout
    }

    /// Parameter layout, keyed by local name.
    pub fn p_layout(&self) -> &Layout {
        &self.p_layout
    }
}

pub enum NodeKind {
    Group { children: Vec<usize> },
    Component(Box<UnitSlot>),
}

/// One system of the flattened tree.
pub struct Node {
    pub name: String,
    /// `""` for the root
    pub pathname: String,
    pub parent: Option<usize>,
    pub active: bool,
    pub kind: NodeKind,
    /// Transfers applied right before this node runs
    pre_transfers: Vec<usize>,
}

impl Node {
    pub fn is_component(&self) -> bool {
        matches!(self.kind, NodeKind::Component(_))
    }

    pub fn unit(&self) -> Option<&UnitSlot> {
        match &self.kind {
            NodeKind::Component(slot) => Some(slot),
            NodeKind::Group { .. } => None,
        }
    }
}

/// A scheduled copy from an output into a parameter.
#[derive(Debug, Clone)]
struct Transfer {
    target: String,
    src: Range<usize>,
    tgt: Range<usize>,
    scale: f64,
    offset: f64,
    by_obj: Option<ObjectTransfer>,
}

#[derive(Debug, Clone)]
struct ObjectTransfer {
    src_unit: usize,
    src_name: String,
    tgt_unit: usize,
    tgt_name: String,
}

struct ScopedVar {
    scoped: String,
    param: bool,
    index: usize,
}

/// Flattening state shared across the recursion.
struct Builder<'a> {
    partition: &'a dyn Partition,
    nodes: Vec<Node>,
    params: Vec<VarMeta>,
    unknowns: Vec<VarMeta>,
    explicit: ConnectionMap,
}

impl Builder<'_> {
    fn is_active(&self, pathname: &str, parent: Option<usize>) -> bool {
        parent.map_or(true, |p| self.nodes[p].active) && self.partition.is_active(pathname)
    }

    fn push(&mut self, name: &str, pathname: &str, parent: Option<usize>, kind: NodeKind) -> usize {
        let active = self.is_active(pathname, parent);
        self.nodes.push(Node {
            name: name.to_string(),
            pathname: pathname.to_string(),
            parent,
            active,
            kind,
            pre_transfers: Vec::new(),
        });
        self.nodes.len() - 1
    }

    fn component(
        &mut self,
        mut component: Box<dyn Component>,
        name: &str,
        pathname: &str,
        parent: usize,
    ) -> Result<(usize, Vec<ScopedVar>)> {
        let mut registry = VariableRegistry::new(pathname);
        component.setup(&mut registry)?;
        registry.finalize(pathname, self.is_active(pathname, Some(parent)));

        let mut scope = Vec::new();
        for meta in registry.params() {
            scope.push(ScopedVar { scoped: meta.relative_name.clone(), param: true, index: self.params.len() });
            self.params.push(meta.clone());
        }
        for meta in registry.unknowns() {
            scope.push(ScopedVar { scoped: meta.relative_name.clone(), param: false, index: self.unknowns.len() });
            self.unknowns.push(meta.clone());
        }

        let slot = UnitSlot {
            component,
            registry,
            jacobian: None,
            jacobian_source: None,
            u_layout: Layout::default(),
            p_layout: Layout::default(),
            u_range: 0..0,
            p_range: 0..0,
            u_objects: ObjectStore::new(),
            p_objects: ObjectStore::new(),
        };
        let idx = self.push(name, pathname, Some(parent), NodeKind::Component(Box::new(slot)));
        Ok((idx, scope))
    }

    fn group(&mut self, group: Group, name: &str, pathname: &str, parent: Option<usize>) -> Result<(usize, Vec<ScopedVar>)> {
        let idx = self.push(name, pathname, parent, NodeKind::Group { children: Vec::new() });
        let mut names = BTreeSet::new();
        let mut children = Vec::new();
        let mut scope = Vec::new();

        for (child_name, child, promotes) in group.children {
            if !names.insert(child_name.clone()) {
                return Err(Error::DuplicateSubsystem { group: pathname.to_string(), name: child_name });
            }
            let child_path = join_path(pathname, &child_name);
            let (child_idx, vars) = match child {
                Child::Component(c) => self.component(c, &child_name, &child_path, idx)?,
                Child::Group(g) => self.group(g, &child_name, &child_path, Some(idx))?,
            };

            for pattern in &promotes {
                if !vars.iter().any(|v| glob_match(pattern, &v.scoped)) {
                    return Err(Error::UnmatchedPromotion { system: child_path, pattern: pattern.clone() });
                }
            }
            for mut var in vars {
                if !promotes.iter().any(|p| glob_match(p, &var.scoped)) {
                    var.scoped = format!("{child_name}{SEPARATOR}{}", var.scoped);
                }
                scope.push(var);
            }
            children.push(child_idx);
        }

        for (source, target) in group.connections {
            self.connect(pathname, &scope, &source, &target)?;
        }

        self.nodes[idx].kind = NodeKind::Group { children };
        Ok((idx, scope))
    }

    fn connect(&mut self, group: &str, scope: &[ScopedVar], source: &str, target: &str) -> Result<()> {
        let invalid = |reason: String| Error::InvalidConnection {
            source_name: join_path(group, source),
            target: join_path(group, target),
            reason,
        };

        let sources: Vec<&ScopedVar> = scope.iter().filter(|v| !v.param && v.scoped == source).collect();
        let src = match sources.as_slice() {
            [one] => &self.unknowns[one.index].pathname,
            [] => return Err(invalid(format!("no output or state named '{source}'"))),
            _ => return Err(invalid(format!("'{source}' matches several outputs"))),
        };

        let targets: Vec<&ScopedVar> = scope.iter().filter(|v| v.param && v.scoped == target).collect();
        if targets.is_empty() {
            return Err(invalid(format!("no parameter named '{target}'")));
        }

        for tgt in targets {
            let tgt = &self.params[tgt.index].pathname;
            if let Some(existing) = self.explicit.get(tgt) {
                if existing != src {
                    return Err(invalid(format!("target is already connected to '{existing}'")));
                }
            }
            self.explicit.insert(tgt.clone(), src.clone());
        }
        Ok(())
    }
}

/// A set-up model: the flattened tree, its connections and its vectors.
pub struct Model {
    nodes: Vec<Node>,
    path_index: HashMap<String, usize>,
    params: Vec<VarMeta>,
    unknowns: Vec<VarMeta>,
    resolution: Resolution,
    pub(crate) vectors: Vectors,
    transfers: Vec<Transfer>,
    generation: u64,
}

impl Model {
    /// Flattens `root`, resolves connections and allocates vectors.
    pub fn build(root: Group, partition: &dyn Partition, units: &UnitRegistry) -> Result<Model> {
        let mut builder = Builder {
            partition,
            nodes: Vec::new(),
            params: Vec::new(),
            unknowns: Vec::new(),
            explicit: ConnectionMap::new(),
        };
        let (_, scope) = builder.group(root, "", "", None)?;
        let Builder { nodes, mut params, mut unknowns, explicit, .. } = builder;

        for var in scope {
            let meta = if var.param { &mut params[var.index] } else { &mut unknowns[var.index] };
            meta.promoted_name = var.scoped;
        }

        let resolution = resolve(&mut params, &unknowns, &explicit, units)?;

        let mut u_layout = Layout::from_metas(&unknowns, |m| m.pathname.as_str());
        for meta in unknowns.iter().filter(|m| !m.remote) {
            u_layout.add_alias(&meta.promoted_name, &meta.pathname);
        }
        let p_layout = Layout::from_metas(&params, |m| m.pathname.as_str());

        let path_index = nodes.iter().enumerate().map(|(i, n)| (n.pathname.clone(), i)).collect();
        let mut model = Model {
            nodes,
            path_index,
            params,
            unknowns,
            resolution,
            vectors: Vectors::new(u_layout, p_layout),
            transfers: Vec::new(),
            generation: 0,
        };
        model.setup_unit_slots();
        model.setup_transfers();

        log::debug!(
            "model set up: {} systems, {} unknowns ({} entries), {} params ({} entries), {} connections",
            model.nodes.len(),
            model.unknowns.len(),
            model.vectors.u_layout.len(),
            model.params.len(),
            model.vectors.p_layout.len(),
            model.resolution.connections.len(),
        );
        Ok(model)
    }

    fn setup_unit_slots(&mut self) {
        let Model { nodes, vectors, params, .. } = self;

        for node in nodes.iter_mut().filter(|n| n.active) {
            let NodeKind::Component(slot) = &mut node.kind else { continue };
            let UnitSlot { registry, u_layout, p_layout, u_range, p_range, u_objects, p_objects, .. } = &mut **slot;

            // Connection-derived metadata lives on the model's copy.
            for meta in registry.params_mut() {
                if let Some(global) = params.iter().find(|p| p.pathname == meta.pathname) {
                    meta.unit_conv = global.unit_conv;
                    meta.promoted_name = global.promoted_name.clone();
                }
            }

            *u_layout = Layout::from_metas(registry.unknowns(), |m| m.relative_name.as_str());
            *p_layout = Layout::from_metas(registry.params(), |m| m.relative_name.as_str());
            *u_range = unit_range(registry.unknowns(), &vectors.u_layout, u_layout.len());
            *p_range = unit_range(registry.params(), &vectors.p_layout, p_layout.len());

            for meta in registry.unknowns() {
                init_value(meta, &vectors.u_layout, &mut vectors.unknowns, u_objects);
            }
            for meta in registry.params() {
                init_value(meta, &vectors.p_layout, &mut vectors.params, p_objects);
            }
        }
    }

    fn setup_transfers(&mut self) {
        let var_owner: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.unit().map(|u| (i, u)))
            .flat_map(|(i, u)| {
                u.registry.params().iter().chain(u.registry.unknowns()).map(move |m| (m.pathname.as_str(), i))
            })
            .collect();

        let mut transfers = Vec::new();
        let mut schedule = Vec::new();
        for (owner, targets) in &self.resolution.owners {
            let Some(&owner_idx) = self.path_index.get(owner) else { continue };
            for target in targets {
                let Some(source) = self.resolution.connections.get(target) else { continue };
                let (Some(&tgt_unit), Some(&src_unit)) = (var_owner.get(target.as_str()), var_owner.get(source.as_str()))
                else {
                    continue;
                };
                let (Some(tgt_slot), Some(src_slot)) =
                    (self.vectors.p_layout.slot(target), self.vectors.u_layout.slot(source))
                else {
                    continue;
                };

                let meta = self.params.iter().find(|m| &m.pathname == target);
                let (scale, offset) = meta.and_then(|m| m.unit_conv).unwrap_or((1.0, 0.0));
                let by_obj = tgt_slot.by_obj.then(|| ObjectTransfer {
                    src_unit,
                    src_name: local_name(source),
                    tgt_unit,
                    tgt_name: local_name(target),
                });

                // Run the transfer right before the child of the owner that contains the target.
                let mut runner = tgt_unit;
                while runner != owner_idx && self.nodes[runner].parent != Some(owner_idx) {
                    match self.nodes[runner].parent {
                        Some(parent) => runner = parent,
                        None => break,
                    }
                }

                schedule.push((runner, transfers.len()));
                transfers.push(Transfer {
                    target: target.clone(),
                    src: src_slot.range(),
                    tgt: tgt_slot.range(),
                    scale,
                    offset,
                    by_obj,
                });
            }
        }

        drop(var_owner);
        for (runner, t) in schedule {
            self.nodes[runner].pre_transfers.push(t);
        }
        self.transfers = transfers;
    }

    /// Systems in execution order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Index of the system with this pathname.
    pub fn node_index(&self, pathname: &str) -> Result<usize> {
        self.path_index.get(pathname).copied().ok_or_else(|| Error::UnknownSubsystem(pathname.to_string()))
    }

    /// The component at `pathname`.
    pub fn unit(&self, pathname: &str) -> Result<&UnitSlot> {
        let node = &self.nodes[self.node_index(pathname)?];
        if !node.active {
            return Err(Error::Inactive(pathname.to_string()));
        }
        node.unit().ok_or_else(|| Error::UnknownSubsystem(pathname.to_string()))
    }

    /// Indices of active components in execution order.
    pub fn active_units(&self) -> Vec<usize> {
        self.nodes.iter().enumerate().filter(|(_, n)| n.active && n.is_component()).map(|(i, _)| i).collect()
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    /// All parameters, in execution order.
    pub fn params(&self) -> &[VarMeta] {
        &self.params
    }

    /// All outputs and states, in execution order.
    pub fn unknowns(&self) -> &[VarMeta] {
        &self.unknowns
    }

    pub fn vectors(&self) -> &Vectors {
        &self.vectors
    }

    /// Incremented by every [`linearize`](Model::linearize).
    pub fn jacobian_generation(&self) -> u64 {
        self.generation
    }

    /// Number of entries in the unknowns vector.
    pub fn size(&self) -> usize {
        self.vectors.u_layout.len()
    }

    /// Whether each unknown entry belongs to a state.
    pub fn state_mask(&self) -> Vec<bool> {
        let mut mask = vec![false; self.size()];
        for (_, slot) in self.vectors.u_layout.iter().filter(|(_, s)| s.state) {
            mask[slot.range()].fill(true);
        }
        mask
    }

    fn find_meta(&self, name: &str) -> Option<&VarMeta> {
        let by_name = |m: &&VarMeta| m.pathname == name || m.promoted_name == name;
        self.unknowns.iter().find(by_name).or_else(|| self.params.iter().find(by_name))
    }

    fn check_local(&self, name: &str) -> Result<()> {
        match self.find_meta(name) {
            Some(meta) if meta.remote => Err(Error::Inactive(meta.pathname.clone())),
            _ => Ok(()),
        }
    }

    /// Canonical pathname and range in the unknowns vector of an output,
    /// a state, or a parameter connected to one.
    pub fn unknown_indices(&self, name: &str) -> Result<(String, Range<usize>)> {
        self.check_local(name)?;
        let layout = &self.vectors.u_layout;
        let lookup = |n: &str| Some((layout.canonical(n)?.to_string(), layout.slot(n)?));

        let found = lookup(name).or_else(|| {
            self.params
                .iter()
                .filter(|p| p.pathname == name || p.promoted_name == name)
                .find_map(|p| self.resolution.source(&p.pathname))
                .and_then(lookup)
        });

        match found {
            Some((_, slot)) if slot.by_obj => Err(Error::NotNumeric(name.to_string())),
            Some((canonical, slot)) => Ok((canonical, slot.range())),
            None => Err(Error::UnresolvedName(name.to_string())),
        }
    }

    /// Current value of an unknown or parameter.
    pub fn get(&self, name: &str) -> Result<Value> {
        self.check_local(name)?;
        if let Some(slot) = self.vectors.u_layout.slot(name) {
            return self.read(slot.clone(), &self.vectors.unknowns, name, false);
        }
        let param = self.params.iter().find(|p| p.pathname == name || p.promoted_name == name);
        match param.and_then(|p| self.vectors.p_layout.slot(&p.pathname)) {
            Some(slot) => self.read(slot.clone(), &self.vectors.params, name, true),
            None => Err(Error::UnknownVariable { owner: String::new(), name: name.to_string() }),
        }
    }

    fn read(&self, slot: crate::vector::Slot, data: &[f64], name: &str, param: bool) -> Result<Value> {
        if slot.by_obj {
            let meta = self.find_meta(name).ok_or_else(|| Error::UnresolvedName(name.to_string()))?;
            let unit = self.unit(owner_path(&meta.pathname))?;
            let objects = if param { &unit.p_objects } else { &unit.u_objects };
            return objects
                .get(&meta.relative_name)
                .cloned()
                .map(Value::Object)
                .ok_or_else(|| Error::NotNumeric(name.to_string()));
        }
        let values = data.get(slot.range()).map(<[f64]>::to_vec).unwrap_or_default();
        if values.len() != slot.size || (slot.size == 0 && slot.shape == [1]) {
            return Err(Error::SizeMismatch { name: name.to_string(), expected: slot.size, actual: values.len() });
        }
        Ok(if slot.shape == [1] { Value::Scalar(values[0]) } else { Value::Array { data: values, shape: slot.shape } })
    }

    /// Overwrites an unknown, or a parameter until its next transfer.
    pub fn set(&mut self, name: &str, values: &[f64]) -> Result<()> {
        self.check_local(name)?;
        let (range, data) = if let Some(slot) = self.vectors.u_layout.slot(name) {
            (slot.range(), &mut self.vectors.unknowns)
        } else {
            let param = self.params.iter().find(|p| p.pathname == name || p.promoted_name == name);
            match param.and_then(|p| self.vectors.p_layout.slot(&p.pathname)) {
                Some(slot) => (slot.range(), &mut self.vectors.params),
                None => return Err(Error::UnknownVariable { owner: String::new(), name: name.to_string() }),
            }
        };
        if range.len() != values.len() {
            return Err(Error::SizeMismatch { name: name.to_string(), expected: range.len(), actual: values.len() });
        }
        data[range].copy_from_slice(values);
        Ok(())
    }

    fn apply_transfers(&mut self, idx: usize) {
        let Model { nodes, transfers, vectors, .. } = self;
        let pending = nodes[idx].pre_transfers.clone();
        for t in pending {
            let tr = &transfers[t];
            match &tr.by_obj {
                Some(obj) => {
                    let value = nodes[obj.src_unit].unit().and_then(|u| u.u_objects.get(&obj.src_name).cloned());
                    if let (Some(value), NodeKind::Component(slot)) = (value, &mut nodes[obj.tgt_unit].kind) {
                        slot.p_objects.insert(obj.tgt_name.clone(), value);
                    }
                }
                None => {
                    for (k, i) in tr.src.clone().enumerate() {
                        vectors.params[tr.tgt.start + k] = tr.scale * vectors.unknowns[i] + tr.offset;
                    }
                }
            }
        }
    }

    /// Applies every transfer, as if each system were about to run.
    pub fn transfer_all(&mut self) {
        for idx in 0..self.nodes.len() {
            self.apply_transfers(idx);
        }
    }

    /// Executes every active component once, depth first.
    pub fn run_once(&mut self) -> Result<()> {
        self.run_node(0)
    }

    fn run_node(&mut self, idx: usize) -> Result<()> {
        if !self.nodes[idx].active {
            return Ok(());
        }
        match &self.nodes[idx].kind {
            NodeKind::Group { children } => {
                for child in children.clone() {
                    self.apply_transfers(child);
                    self.run_node(child)?;
                }
                Ok(())
            }
            NodeKind::Component(_) => {
                log::trace!("running '{}'", self.nodes[idx].pathname);
                self.compute_unit(idx)
            }
        }
    }

    fn compute_unit(&mut self, idx: usize) -> Result<()> {
        let Model { nodes, vectors, .. } = self;
        let Node { pathname, kind, .. } = &mut nodes[idx];
        let NodeKind::Component(slot) = kind else { return Ok(()) };
        let UnitSlot { component, u_layout, p_layout, u_range, p_range, u_objects, p_objects, .. } = &mut **slot;

        let params = VecView::new(pathname, p_layout, &vectors.params[p_range.clone()]).with_objects(p_objects);
        let mut unknowns =
            VecViewMut::new(pathname, u_layout, &mut vectors.unknowns[u_range.clone()]).with_objects(u_objects);
        component.compute_outputs(&params, &mut unknowns)
    }

    /// Evaluates every residual after applying all transfers and returns the
    /// residual norm.
    pub fn apply_nonlinear(&mut self) -> Result<f64> {
        self.transfer_all();
        let Model { nodes, vectors, .. } = self;

        for node in nodes.iter_mut().filter(|n| n.active) {
            let Node { pathname, kind, .. } = node;
            let NodeKind::Component(slot) = kind else { continue };
            let UnitSlot { component, u_layout, p_layout, u_range, p_range, u_objects, p_objects, .. } = &mut **slot;

            let params = VecView::new(pathname, p_layout, &vectors.params[p_range.clone()]).with_objects(p_objects);
            let mut unknowns =
                VecViewMut::new(pathname, u_layout, &mut vectors.unknowns[u_range.clone()]).with_objects(u_objects);
            let mut resids = VecViewMut::new(pathname, u_layout, &mut vectors.resids[u_range.clone()]);
            component.evaluate_residual(&params, &mut unknowns, &mut resids)?;
        }

        Ok(vectors.resids.iter().map(|r| r * r).sum::<f64>().sqrt())
    }

    /// Rebuilds every component's Jacobian cache.
    ///
    /// Components without analytic blocks (and without their own product) or
    /// forcing finite differences get finite-difference blocks. Every cache is
    /// validated against the component's variables.
    pub fn linearize(&mut self) -> Result<()> {
        self.transfer_all();
        let Model { nodes, vectors, .. } = self;

        for node in nodes.iter_mut().filter(|n| n.active) {
            let Node { pathname, kind, .. } = node;
            let NodeKind::Component(slot) = kind else { continue };
            let UnitSlot { component, u_layout, p_layout, u_range, p_range, u_objects, p_objects, .. } = &mut **slot;

            let p = &vectors.params[p_range.clone()];
            let u = &vectors.unknowns[u_range.clone()];
            let r = &vectors.resids[u_range.clone()];
            let fd = component.fd_options();

            let analytic = if fd.force_fd {
                None
            } else {
                component.linearize(
                    &VecView::new(pathname, p_layout, p).with_objects(p_objects),
                    &VecView::new(pathname, u_layout, u).with_objects(u_objects),
                    &VecView::new(pathname, u_layout, r),
                )?
            };

            let (jacobian, source) = match analytic {
                Some(jac) => (Some(jac), JacobianSource::Analytic),
                None if !fd.force_fd && component.provides_jacobian_product() => (None, JacobianSource::Custom),
                None => {
                    let point = UnitPoint {
                        pathname,
                        u_layout,
                        p_layout,
                        unknowns: u,
                        params: p,
                        u_objects,
                        p_objects,
                    };
                    log::trace!("finite differencing '{pathname}'");
                    (Some(unit_fd_jacobian(component.as_mut(), &point, &fd)?), JacobianSource::FiniteDifference)
                }
            };

            if let Some(jac) = &jacobian {
                jac.validate(pathname, u_layout, p_layout)?;
            }
            slot.jacobian = jacobian;
            slot.jacobian_source = Some(source);
        }

        self.generation += 1;
        Ok(())
    }

    /// Multiplies by the global operator `A = -dR/du` (forward) or its
    /// transpose (reverse), using the cached component Jacobians.
    pub fn apply_linear(&mut self, mode: LinearMode, x: &[f64]) -> Result<Vec<f64>> {
        let n = self.size();
        if x.len() != n {
            return Err(Error::SizeMismatch { name: "linear operand".to_string(), expected: n, actual: x.len() });
        }
        let Model { nodes, vectors, transfers, .. } = self;

        vectors.clear_derivatives();
        match mode {
            LinearMode::Forward => {
                vectors.d_unknowns.copy_from_slice(x);
                for tr in transfers.iter().filter(|t| t.by_obj.is_none()) {
                    for (k, i) in tr.src.clone().enumerate() {
                        vectors.d_params[tr.tgt.start + k] = tr.scale * vectors.d_unknowns[i];
                    }
                }
            }
            LinearMode::Reverse => {
                for (dr, v) in vectors.d_resids.iter_mut().zip(x) {
                    *dr = -v;
                }
            }
        }

        for node in nodes.iter().filter(|n| n.active) {
            let NodeKind::Component(slot) = &node.kind else { continue };
            let (ur, pr) = (slot.u_range.clone(), slot.p_range.clone());
            let mut ctx = LinearContext {
                params: VecView::new(&node.pathname, &slot.p_layout, &vectors.params[pr.clone()])
                    .with_objects(&slot.p_objects),
                unknowns: VecView::new(&node.pathname, &slot.u_layout, &vectors.unknowns[ur.clone()])
                    .with_objects(&slot.u_objects),
                d_params: VecViewMut::new(&node.pathname, &slot.p_layout, &mut vectors.d_params[pr]),
                d_unknowns: VecViewMut::new(&node.pathname, &slot.u_layout, &mut vectors.d_unknowns[ur.clone()]),
                d_resids: VecViewMut::new(&node.pathname, &slot.u_layout, &mut vectors.d_resids[ur]),
                jacobian: slot.jacobian.as_ref(),
            };
            slot.component.apply_linear(&mut ctx, mode)?;
        }

        let states = self.state_mask();
        let vectors = &self.vectors;
        let mut out = vec![0.0; n];
        match mode {
            LinearMode::Forward => {
                for i in 0..n {
                    out[i] = if states[i] { -vectors.d_resids[i] } else { x[i] - vectors.d_resids[i] };
                }
            }
            LinearMode::Reverse => {
                for i in 0..n {
                    out[i] = if states[i] { vectors.d_unknowns[i] } else { x[i] };
                }
                for tr in self.transfers.iter().filter(|t| t.by_obj.is_none()) {
                    for (k, i) in tr.src.clone().enumerate() {
                        out[i] += tr.scale * vectors.d_params[tr.tgt.start + k];
                    }
                }
            }
        }
        Ok(out)
    }

    /// Applies one component's linear product on caller-provided buffers.
    pub(crate) fn unit_apply_linear(
        &self,
        idx: usize,
        mode: LinearMode,
        d_params: &mut [f64],
        d_unknowns: &mut [f64],
        d_resids: &mut [f64],
    ) -> Result<()> {
        let node = &self.nodes[idx];
        let NodeKind::Component(slot) = &node.kind else { return Ok(()) };
        let mut ctx = LinearContext {
            params: VecView::new(&node.pathname, &slot.p_layout, &self.vectors.params[slot.p_range.clone()])
                .with_objects(&slot.p_objects),
            unknowns: VecView::new(&node.pathname, &slot.u_layout, &self.vectors.unknowns[slot.u_range.clone()])
                .with_objects(&slot.u_objects),
            d_params: VecViewMut::new(&node.pathname, &slot.p_layout, d_params),
            d_unknowns: VecViewMut::new(&node.pathname, &slot.u_layout, d_unknowns),
            d_resids: VecViewMut::new(&node.pathname, &slot.u_layout, d_resids),
            jacobian: slot.jacobian.as_ref(),
        };
        slot.component.apply_linear(&mut ctx, mode)
    }

    /// Finite difference Jacobian of one component at the current point.
    pub(crate) fn unit_fd(&mut self, idx: usize, options: &FdOptions) -> Result<Jacobian> {
        let Model { nodes, vectors, .. } = self;
        let Node { pathname, kind, .. } = &mut nodes[idx];
        let NodeKind::Component(slot) = kind else { return Ok(Jacobian::new()) };
        let UnitSlot { component, u_layout, p_layout, u_range, p_range, u_objects, p_objects, .. } = &mut **slot;
        let point = UnitPoint {
            pathname,
            u_layout,
            p_layout,
            unknowns: &vectors.unknowns[u_range.clone()],
            params: &vectors.params[p_range.clone()],
            u_objects,
            p_objects,
        };
        unit_fd_jacobian(component.as_mut(), &point, options)
    }

    /// Writes the system tree with vector slices and values.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        self.dump_node(0, 0, out)?;
        out.flush()?;
        Ok(())
    }

    fn dump_node(&self, idx: usize, nest: usize, out: &mut dyn Write) -> Result<()> {
        let node = &self.nodes[idx];
        let indent = " ".repeat(nest);
        let name = if node.pathname.is_empty() { "root" } else { &node.name };
        match &node.kind {
            NodeKind::Group { children } => {
                writeln!(out, "{indent}Group '{name}'    active: {}", node.active)?;
                for &child in children {
                    self.dump_node(child, nest + 2, out)?;
                }
            }
            NodeKind::Component(slot) => {
                writeln!(
                    out,
                    "{indent}Component '{name}'    usize:{}  psize:{}  active: {}",
                    slot.u_layout.len(),
                    slot.p_layout.len(),
                    node.active
                )?;
                let width = slot.u_layout.names().map(str::len).max().unwrap_or(12);
                for (var, s) in slot.u_layout.iter() {
                    if s.by_obj {
                        writeln!(out, "{}{var:<width$}  (by_obj)", " ".repeat(nest + 8))?;
                    } else {
                        let global = slot.u_range.start + s.offset;
                        let values = &self.vectors.unknowns[global..global + s.size];
                        let label = format!("u[{}:{}]", global, global + s.size);
                        writeln!(out, "{}{var:<width$} {label:<21} {values:?}", " ".repeat(nest + 8))?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn unit_range(metas: &[VarMeta], global: &Layout, len: usize) -> Range<usize> {
    let start = metas.iter().find_map(|m| global.slot(&m.pathname)).map_or(0, |s| s.offset);
    start..start + len
}

fn init_value(meta: &VarMeta, layout: &Layout, data: &mut [f64], objects: &mut ObjectStore) {
    let Some(slot) = layout.slot(&meta.pathname) else { return };
    match &meta.value {
        Value::Object(obj) => {
            objects.insert(meta.relative_name.clone(), obj.clone());
        }
        value if slot.by_obj => {
            objects.insert(meta.relative_name.clone(), Rc::new(value.clone()));
        }
        value => data[slot.range()].copy_from_slice(&value.flat()),
    }
}

fn owner_path(pathname: &str) -> &str {
    pathname.rsplit_once(SEPARATOR).map_or("", |(owner, _)| owner)
}

fn local_name(pathname: &str) -> String {
    pathname.rsplit_once(SEPARATOR).map_or(pathname, |(_, name)| name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{IndepVarComp, LinearMap};
    use crate::partition::{InactiveSet, Serial};
    use crate::VarSpec;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::DMatrix;

    fn build(root: Group) -> Result<Model> {
        Model::build(root, &Serial, &UnitRegistry::new())
    }

    /// px:x -> c1 (y = 2x + 1) -> c2 (y = [3; -1] x)
    fn chain() -> Group {
        let mut root = Group::new();
        root.add("px", IndepVarComp::new("x", 2.0), &[]);
        root.add("c1", LinearMap::new(DMatrix::from_element(1, 1, 2.0), vec![1.0]), &[]);
        root.add("c2", LinearMap::new(DMatrix::from_row_slice(2, 1, &[3.0, -1.0]), vec![0.0, 0.0]), &[]);
        root.connect("px:x", "c1:x");
        root.connect("c1:y", "c2:x");
        root
    }

    #[test]
    fn test_glob() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("x*", "x1"));
        assert!(glob_match("*_in", "flow_in"));
        assert!(glob_match("a*c*e", "abcde"));
        assert!(!glob_match("x*", "yx"));
        assert!(!glob_match("x", "x1"));
    }

    #[test]
    fn test_pathnames_and_promotion() {
        let mut sub = Group::new();
        sub.add("c1", LinearMap::new(DMatrix::from_element(1, 1, 1.0), vec![0.0]), &["x"]);
        let mut root = Group::new();
        root.add("px", IndepVarComp::new("x", 1.0), &["x"]);
        root.add_group("sub", sub, &["*"]);

        let model = build(root).unwrap();
        let x = model.params().iter().find(|m| m.pathname == "sub:c1:x").unwrap();
        assert_eq!(x.promoted_name, "x");
        assert_eq!(x.relative_name, "x");
        let y = model.unknowns().iter().find(|m| m.pathname == "sub:c1:y").unwrap();
        assert_eq!(y.promoted_name, "c1:y");
        assert_eq!(model.resolution().source("sub:c1:x"), Some("px:x"));
        assert!(model.unit("sub:c1").is_ok());
    }

    #[test]
    fn test_unmatched_promotion_and_duplicates() {
        let mut root = Group::new();
        root.add("px", IndepVarComp::new("x", 1.0), &["nope*"]);
        assert!(matches!(build(root), Err(Error::UnmatchedPromotion { ref pattern, .. }) if pattern == "nope*"));

        let mut root = Group::new();
        root.add("px", IndepVarComp::new("x", 1.0), &[]);
        root.add("px", IndepVarComp::new("y", 1.0), &[]);
        assert!(matches!(build(root), Err(Error::DuplicateSubsystem { .. })));
    }

    #[test]
    fn test_invalid_explicit_connections() {
        let mut root = chain();
        root.connect("c2:y", "c1:nope");
        assert!(matches!(build(root), Err(Error::InvalidConnection { .. })));

        let mut root = chain();
        root.connect("px:x", "c2:x");
        let err = build(root).err().unwrap();
        assert!(err.to_string().contains("already connected"));
    }

    #[test]
    fn test_run_once_and_transfer_ownership() {
        let mut sub = Group::new();
        sub.add("c1", LinearMap::new(DMatrix::from_element(1, 1, 2.0), vec![1.0]), &[]);
        sub.add("c2", LinearMap::new(DMatrix::from_element(1, 1, 3.0), vec![0.0]), &[]);
        sub.connect("c1:y", "c2:x");
        let mut root = Group::new();
        root.add("px", IndepVarComp::new("x", 2.0), &[]);
        root.add_group("sub", sub, &[]);
        root.connect("px:x", "sub:c1:x");

        let mut model = build(root).unwrap();
        assert_eq!(model.resolution().owned_by(""), ["sub:c1:x"]);
        assert_eq!(model.resolution().owned_by("sub"), ["sub:c2:x"]);

        model.run_once().unwrap();
        assert_eq!(model.get("sub:c1:y").unwrap().flat(), vec![5.0]);
        assert_eq!(model.get("sub:c2:y").unwrap().flat(), vec![15.0]);
        assert!(model.apply_nonlinear().unwrap() < 1e-14);
    }

    #[test]
    fn test_unit_conversion_in_transfer() {
        struct Meters;
        impl Component for Meters {
            fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
                vars.add_param("len", VarSpec::value(0.0).units("cm"))
            }
        }

        let mut root = Group::new();
        root.add("src", IndepVarComp::new("len", 1.5).units("len", "m"), &["len"]);
        root.add("tgt", Meters, &["len"]);
        let mut model = build(root).unwrap();
        model.run_once().unwrap();
        assert_approx_eq!(model.get("tgt:len").unwrap().flat()[0], 150.0);
    }

    #[test]
    fn test_linear_operator_transpose() {
        let mut model = build(chain()).unwrap();
        model.run_once().unwrap();
        model.linearize().unwrap();

        let n = model.size();
        assert_eq!(n, 4);
        let mut a = DMatrix::zeros(n, n);
        let mut at = DMatrix::zeros(n, n);
        for j in 0..n {
            let mut e = vec![0.0; n];
            e[j] = 1.0;
            let col = model.apply_linear(LinearMode::Forward, &e).unwrap();
            let row = model.apply_linear(LinearMode::Reverse, &e).unwrap();
            for i in 0..n {
                a[(i, j)] = col[i];
                at[(i, j)] = row[i];
            }
        }
        assert_eq!(a.transpose(), at);
        assert_eq!(a[(1, 0)], -2.0);
        assert_eq!(a[(2, 1)], -3.0);
        assert_eq!(a[(3, 1)], 1.0);
    }

    #[test]
    fn test_inactive_units_skipped() {
        let mut model = Model::build(chain(), &InactiveSet::new(["c2"]), &UnitRegistry::new()).unwrap();
        assert_eq!(model.size(), 2);
        assert_eq!(model.active_units().len(), 2);
        model.run_once().unwrap();
        assert_eq!(model.get("c1:y").unwrap().flat(), vec![5.0]);
        assert!(matches!(model.get("c2:y"), Err(Error::Inactive(_))));
        assert!(matches!(model.unit("c2"), Err(Error::Inactive(_))));
        model.linearize().unwrap();
    }

    #[test]
    fn test_name_resolution() {
        let model = build(chain()).unwrap();
        assert_eq!(model.unknown_indices("c1:y").unwrap(), ("c1:y".to_string(), 1..2));
        assert_eq!(model.unknown_indices("c2:x").unwrap(), ("c1:y".to_string(), 1..2));
        assert!(matches!(model.unknown_indices("c9:z"), Err(Error::UnresolvedName(_))));
    }

    #[test]
    fn test_dump() {
        let mut model = build(chain()).unwrap();
        model.run_once().unwrap();
        let mut out = Vec::new();
        model.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Group 'root'"));
        assert!(text.contains("Component 'c2'    usize:2  psize:1"));
        assert!(text.contains("u[2:4]"));
    }
}
