//! map.rs — Table de hachage script à adressage ouvert.
//!
//! Sondage linéaire avec pierres tombales :
//! - clé `Undefined` + valeur `false` : slot vide,
//! - clé `Undefined` + valeur `true`  : pierre tombale.
//!
//! Croissance ×4 au-delà d'un facteur de charge de 0.8, rétrécissement
//! symétrique, jamais sous [`MAP_MIN_CAPACITY`] slots.

use crate::object::ObjHeader;
use crate::value::{value_hash, value_is_equal, Obj, Value};
use crate::{gc, Gc, Vm};

/// Capacité plancher une fois la table allouée.
pub const MAP_MIN_CAPACITY: usize = 64;

/// Facteur de charge maximal, en pour cent.
const MAP_LOAD_PERCENT: usize = 80;

#[derive(Clone)]
pub struct Entry {
    pub key: Value,
    pub value: Value,
}

impl Entry {
    fn empty() -> Entry {
        Entry { key: Value::Undefined, value: Value::Bool(false) }
    }

    fn tombstone() -> Entry {
        Entry { key: Value::Undefined, value: Value::Bool(true) }
    }

    fn is_unused(&self) -> bool {
        self.key.is_undefined()
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_undefined() && matches!(self.value, Value::Bool(true))
    }
}

pub struct ObjMap {
    pub header: ObjHeader,
    entries: Vec<Entry>,
    /// Entrées vivantes.
    count: usize,
    /// Entrées vivantes + pierres tombales (borne le sondage).
    used: usize,
}

impl ObjMap {
    pub fn new(vm: &mut Vm) -> Gc<ObjMap> {
        let obj = gc(ObjMap {
            header: ObjHeader::new(vm.map_class.clone()),
            entries: Vec::new(),
            count: 0,
            used: 0,
        });
        vm.register(Obj::Map(obj.clone()), std::mem::size_of::<ObjMap>());
        obj
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Slot d'une clé : `Ok(index_occupé)` ou `Err(index_d'insertion)`.
    fn find_slot(&self, key: &Value, hash: u32) -> Result<usize, usize> {
        let cap = self.entries.len();
        debug_assert!(cap > 0);
        let mut idx = hash as usize % cap;
        let mut first_tombstone = None;
        loop {
            let entry = &self.entries[idx];
            if entry.is_unused() {
                if entry.is_tombstone() {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                } else {
                    // Slot vide : fin du sondage.
                    return Err(first_tombstone.unwrap_or(idx));
                }
            } else if value_is_equal(&entry.key, key) {
                return Ok(idx);
            }
            idx = (idx + 1) % cap;
        }
    }

    /// Insère ou remplace. `false` si la clé n'est pas hashable.
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        let Some(hash) = value_hash(&key) else { return false };
        if self.entries.is_empty() {
            self.resize(MAP_MIN_CAPACITY);
        } else if (self.used + 1) * 100 > self.entries.len() * MAP_LOAD_PERCENT {
            self.resize(self.entries.len() * 4);
        }
        match self.find_slot(&key, hash) {
            Ok(idx) => self.entries[idx].value = value,
            Err(idx) => {
                if !self.entries[idx].is_tombstone() {
                    self.used += 1;
                }
                self.entries[idx] = Entry { key, value };
                self.count += 1;
            }
        }
        true
    }

    /// Valeur associée, `Undefined` si absente ou clé non hashable.
    pub fn get(&self, key: &Value) -> Value {
        let Some(hash) = value_hash(key) else { return Value::Undefined };
        if self.entries.is_empty() {
            return Value::Undefined;
        }
        match self.find_slot(key, hash) {
            Ok(idx) => self.entries[idx].value.clone(),
            Err(_) => Value::Undefined,
        }
    }

    pub fn contains(&self, key: &Value) -> bool {
        !self.get(key).is_undefined()
    }

    /// Retire la clé, retourne l'ancienne valeur (`Undefined` si absente).
    pub fn remove(&mut self, key: &Value) -> Value {
        let Some(hash) = value_hash(key) else { return Value::Undefined };
        if self.entries.is_empty() {
            return Value::Undefined;
        }
        let Ok(idx) = self.find_slot(key, hash) else {
            return Value::Undefined;
        };
        let old = std::mem::replace(&mut self.entries[idx], Entry::tombstone());
        self.count -= 1;

        // Rétrécissement symétrique de la croissance ×4.
        let cap = self.entries.len();
        if cap > MAP_MIN_CAPACITY && self.count * 100 < (cap / 4) * MAP_LOAD_PERCENT {
            self.resize((cap / 4).max(MAP_MIN_CAPACITY));
        }
        old.value
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
        self.used = 0;
    }

    /// Entrée vivante suivante à partir de `idx` inclus, pour l'itération.
    pub fn next_live_entry(&self, idx: usize) -> Option<(usize, &Entry)> {
        self.entries[idx..]
            .iter()
            .enumerate()
            .find(|(_, e)| !e.is_unused())
            .map(|(off, e)| (idx + off, e))
    }

    /// Reconstruit la table à `new_cap` slots, pierres tombales purgées.
    fn resize(&mut self, new_cap: usize) {
        let old = std::mem::replace(&mut self.entries, vec![Entry::empty(); new_cap]);
        self.count = 0;
        self.used = 0;
        for entry in old {
            if !entry.is_unused() {
                let hash = value_hash(&entry.key).expect("live key is hashable");
                let idx = match self.find_slot(&entry.key, hash) {
                    Err(idx) => idx,
                    Ok(idx) => idx,
                };
                self.entries[idx] = entry;
                self.count += 1;
                self.used += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::Num(n)
    }

    #[test]
    fn set_then_get() {
        let mut vm = Vm::new();
        let m = ObjMap::new(&mut vm);
        let mut m = m.borrow_mut();
        assert!(m.set(num(1.0), num(10.0)));
        assert!(m.set(num(2.0), num(20.0)));
        assert_eq!(m.get(&num(1.0)), num(10.0));
        assert_eq!(m.get(&num(2.0)), num(20.0));
        assert!(m.get(&num(3.0)).is_undefined());
    }

    #[test]
    fn remove_leaves_no_visible_tombstone() {
        let mut vm = Vm::new();
        let m = ObjMap::new(&mut vm);
        let mut m = m.borrow_mut();
        m.set(num(1.0), num(10.0));
        assert_eq!(m.remove(&num(1.0)), num(10.0));
        assert!(m.get(&num(1.0)).is_undefined());
        assert_eq!(m.len(), 0);
        // Réinsertion après tombale.
        m.set(num(1.0), num(11.0));
        assert_eq!(m.get(&num(1.0)), num(11.0));
    }

    #[test]
    fn unhashable_key_is_rejected() {
        let mut vm = Vm::new();
        let inner = ObjMap::new(&mut vm);
        let m = ObjMap::new(&mut vm);
        let mut m = m.borrow_mut();
        assert!(!m.set(Value::Obj(Obj::Map(inner)), num(1.0)));
        assert_eq!(m.len(), 0);
    }

    // Cycles set/remove/set sous le facteur de charge : jamais de tombale
    // rendue comme entrée, et la capacité repasse par le plancher.
    #[test]
    fn churn_below_load_factor() {
        let mut vm = Vm::new();
        let m = ObjMap::new(&mut vm);
        let mut m = m.borrow_mut();
        for round in 0..4 {
            for i in 0..200 {
                m.set(num(i as f64), num((round * 1000 + i) as f64));
            }
            assert!(m.capacity() * MAP_LOAD_PERCENT >= m.len() * 100);
            for i in 0..200 {
                assert_eq!(m.remove(&num(i as f64)), num((round * 1000 + i) as f64));
            }
            assert_eq!(m.len(), 0);
        }
        assert_eq!(m.capacity(), MAP_MIN_CAPACITY);
        m.set(num(7.0), num(70.0));
        assert_eq!(m.get(&num(7.0)), num(70.0));
    }

    #[test]
    fn growth_is_times_four() {
        let mut vm = Vm::new();
        let m = ObjMap::new(&mut vm);
        let mut m = m.borrow_mut();
        m.set(num(0.0), num(0.0));
        assert_eq!(m.capacity(), MAP_MIN_CAPACITY);
        for i in 1..=52 {
            m.set(num(i as f64), num(i as f64));
        }
        assert_eq!(m.capacity(), MAP_MIN_CAPACITY * 4);
    }
}
