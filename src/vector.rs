//! Flat vector storage addressed by variable name.
//!
//! All values of one kind (unknowns, residuals, parameters and their
//! derivative counterparts) live in one contiguous `Vec<f64>` owned by the
//! model. A [`Layout`] maps names to slices of it. Components only ever see
//! borrowed [`VecView`]/[`VecViewMut`] windows over their own slice, keyed by
//! local name.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::rc::Rc;

use crate::{Error, Result, VarMeta};

/// Opaque values of pass-by-object variables, keyed like the layout.
pub type ObjectStore = BTreeMap<String, Rc<dyn Any>>;

/// Position of one variable in a flat vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub offset: usize,
    /// Zero for pass-by-object variables
    pub size: usize,
    pub shape: Vec<usize>,
    pub by_obj: bool,
    pub state: bool,
}

impl Slot {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Name to slot mapping for one flat vector.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    names: Vec<String>,
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    len: usize,
}

impl Layout {
    /// Lays out `metas` back to back, keyed by `key`. Remote variables are skipped.
    pub fn from_metas<'m, I, K>(metas: I, key: K) -> Self
    where
        I: IntoIterator<Item = &'m VarMeta>,
        K: Fn(&VarMeta) -> &str,
    {
        let mut layout = Layout::default();
        for meta in metas.into_iter().filter(|m| !m.remote) {
            layout.push(
                key(meta),
                Slot {
                    offset: layout.len,
                    size: meta.size,
                    shape: meta.shape.clone(),
                    by_obj: meta.pass_by_obj,
                    state: meta.is_state(),
                },
            );
        }
        layout
    }

    fn push(&mut self, name: &str, slot: Slot) {
        self.len += slot.size;
        self.index.insert(name.to_string(), self.slots.len());
        self.names.push(name.to_string());
        self.slots.push(slot);
    }

    /// Makes `alias` resolve to the same slot as `name`.
    pub fn add_alias(&mut self, alias: &str, name: &str) {
        if let Some(&i) = self.index.get(name) {
            self.index.entry(alias.to_string()).or_insert(i);
        }
    }

    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.index.get(name).map(|&i| &self.slots[i])
    }

    /// Canonical name for `name`, resolving aliases.
    pub fn canonical(&self, name: &str) -> Option<&str> {
        self.index.get(name).map(|&i| self.names[i].as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Total number of flat entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Canonical names in storage order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Canonical names and slots in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Slot)> {
        self.names.iter().map(String::as_str).zip(self.slots.iter())
    }
}

fn lookup<'l>(owner: &str, layout: &'l Layout, name: &str) -> Result<&'l Slot> {
    layout
        .slot(name)
        .ok_or_else(|| Error::UnknownVariable { owner: owner.to_string(), name: name.to_string() })
}

fn numeric<'l>(owner: &str, layout: &'l Layout, name: &str) -> Result<&'l Slot> {
    let slot = lookup(owner, layout, name)?;
    if slot.by_obj {
        return Err(Error::NotNumeric(name.to_string()));
    }
    Ok(slot)
}

/// Read-only window onto a flat vector.
#[derive(Clone, Copy)]
pub struct VecView<'a> {
    owner: &'a str,
    layout: &'a Layout,
    data: &'a [f64],
    objects: Option<&'a ObjectStore>,
}

impl<'a> VecView<'a> {
    pub fn new(owner: &'a str, layout: &'a Layout, data: &'a [f64]) -> Self {
        VecView { owner, layout, data, objects: None }
    }

    /// Attaches the pass-by-object values.
    pub fn with_objects(mut self, objects: &'a ObjectStore) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Values of a numeric variable.
    pub fn get(&self, name: &str) -> Result<&'a [f64]> {
        let slot = numeric(self.owner, self.layout, name)?;
        Ok(&self.data[slot.range()])
    }

    /// First value of a numeric variable.
    pub fn scalar(&self, name: &str) -> Result<f64> {
        let values = self.get(name)?;
        values.first().copied().ok_or_else(|| Error::SizeMismatch {
            name: name.to_string(),
            expected: 1,
            actual: 0,
        })
    }

    /// Opaque value of a pass-by-object variable.
    pub fn object(&self, name: &str) -> Result<Rc<dyn Any>> {
        self.objects.and_then(|objects| objects.get(name)).cloned().ok_or_else(|| {
            Error::UnknownVariable { owner: self.owner.to_string(), name: name.to_string() }
        })
    }

    /// Range of `name` inside this vector.
    pub fn local_indices(&self, name: &str) -> Result<Range<usize>> {
        Ok(lookup(self.owner, self.layout, name)?.range())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layout.contains(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'a str> {
        self.layout.names()
    }

    pub fn layout(&self) -> &'a Layout {
        self.layout
    }

    /// Pathname of the component the view belongs to.
    pub fn owner(&self) -> &'a str {
        self.owner
    }

    pub fn as_slice(&self) -> &'a [f64] {
        self.data
    }
}

/// Mutable window onto a flat vector.
pub struct VecViewMut<'a> {
    owner: &'a str,
    layout: &'a Layout,
    data: &'a mut [f64],
    objects: Option<&'a mut ObjectStore>,
}

impl<'a> VecViewMut<'a> {
    pub fn new(owner: &'a str, layout: &'a Layout, data: &'a mut [f64]) -> Self {
        VecViewMut { owner, layout, data, objects: None }
    }

    pub fn with_objects(mut self, objects: &'a mut ObjectStore) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn get(&self, name: &str) -> Result<&[f64]> {
        let slot = numeric(self.owner, self.layout, name)?;
        Ok(&self.data[slot.range()])
    }

    pub fn scalar(&self, name: &str) -> Result<f64> {
        self.as_view().scalar(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut [f64]> {
        let slot = numeric(self.owner, self.layout, name)?;
        Ok(&mut self.data[slot.range()])
    }

    /// Overwrites a numeric variable; the length must match.
    pub fn set(&mut self, name: &str, values: &[f64]) -> Result<()> {
        let target = self.get_mut(name)?;
        if target.len() != values.len() {
            return Err(Error::SizeMismatch {
                name: name.to_string(),
                expected: target.len(),
                actual: values.len(),
            });
        }
        target.copy_from_slice(values);
        Ok(())
    }

    pub fn set_scalar(&mut self, name: &str, value: f64) -> Result<()> {
        self.set(name, &[value])
    }

    pub fn set_object(&mut self, name: &str, value: Rc<dyn Any>) -> Result<()> {
        let slot = lookup(self.owner, self.layout, name)?;
        match (&mut self.objects, slot.by_obj) {
            (Some(objects), true) => {
                objects.insert(name.to_string(), value);
                Ok(())
            }
            _ => Err(Error::UnknownVariable { owner: self.owner.to_string(), name: name.to_string() }),
        }
    }

    /// Copy of the attached object slots, if any.
    pub fn objects_snapshot(&self) -> Option<ObjectStore> {
        self.objects.as_deref().cloned()
    }

    /// Puts back object slots taken with [`objects_snapshot`](Self::objects_snapshot).
    pub fn restore_objects(&mut self, saved: ObjectStore) {
        if let Some(objects) = &mut self.objects {
            **objects = saved;
        }
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    pub fn as_slice(&self) -> &[f64] {
        &*self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut *self.data
    }

    pub fn local_indices(&self, name: &str) -> Result<Range<usize>> {
        Ok(lookup(self.owner, self.layout, name)?.range())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.layout.names()
    }

    /// Reborrows as a read-only view.
    pub fn as_view(&self) -> VecView<'_> {
        VecView { owner: self.owner, layout: self.layout, data: &*self.data, objects: self.objects.as_deref() }
    }
}

/// Global flat vectors of a set-up model.
#[derive(Debug, Clone, Default)]
pub struct Vectors {
    /// Outputs and states
    pub unknowns: Vec<f64>,
    pub resids: Vec<f64>,
    pub params: Vec<f64>,
    pub d_unknowns: Vec<f64>,
    pub d_resids: Vec<f64>,
    pub d_params: Vec<f64>,
    /// Keyed by absolute pathname, promoted names as aliases
    pub u_layout: Layout,
    /// Keyed by absolute pathname
    pub p_layout: Layout,
}

impl Vectors {
    /// Allocates zeroed storage for the given layouts.
    pub fn new(u_layout: Layout, p_layout: Layout) -> Self {
        let (nu, np) = (u_layout.len(), p_layout.len());
        Vectors {
            unknowns: vec![0.0; nu],
            resids: vec![0.0; nu],
            params: vec![0.0; np],
            d_unknowns: vec![0.0; nu],
            d_resids: vec![0.0; nu],
            d_params: vec![0.0; np],
            u_layout,
            p_layout,
        }
    }

    /// Zeroes every derivative vector.
    pub fn clear_derivatives(&mut self) {
        self.d_unknowns.fill(0.0);
        self.d_resids.fill(0.0);
        self.d_params.fill(0.0);
    }
}
