//! Iterator state for builtin sequences

use std::sync::Arc;

use parking_lot::Mutex;

use super::Value;

/// Position inside an iterable
pub enum IterState {
    List {
        list: Arc<Mutex<Vec<Value>>>,
        index: usize,
    },
    Tuple {
        items: Arc<[Value]>,
        index: usize,
    },
    Str {
        chars: Vec<char>,
        index: usize,
    },
    Range {
        next: i64,
        stop: i64,
        step: i64,
    },
    /// Snapshot of values, used for dict keys
    Values {
        items: Vec<Value>,
        index: usize,
    },
}

impl IterState {
    pub fn range(start: i64, stop: i64, step: i64) -> Self {
        IterState::Range {
            next: start,
            stop,
            step,
        }
    }

    /// Advance, returning `None` once exhausted
    ///
    /// A list iterator observes appends made while iterating.
    pub fn next(&mut self) -> Option<Value> {
        match self {
            IterState::List { list, index } => {
                let item = list.lock().get(*index).cloned();
                if item.is_some() {
                    *index += 1;
                }
                item
            }
            IterState::Tuple { items, index } => {
                let item = items.get(*index).cloned();
                if item.is_some() {
                    *index += 1;
                }
                item
            }
            IterState::Str { chars, index } => {
                let c = chars.get(*index).copied();
                c.map(|c| {
                    *index += 1;
                    let mut buf = [0u8; 4];
                    Value::str(c.encode_utf8(&mut buf))
                })
            }
            IterState::Range { next, stop, step } => {
                let more = if *step > 0 { *next < *stop } else { *next > *stop };
                if !more {
                    return None;
                }
                let current = *next;
                match next.checked_add(*step) {
                    Some(n) => *next = n,
                    None => *next = *stop,
                }
                Some(Value::Int(current))
            }
            IterState::Values { items, index } => {
                let item = items.get(*index).cloned();
                if item.is_some() {
                    *index += 1;
                }
                item
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mut it: IterState) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(v) = it.next() {
            out.push(v.to_string());
        }
        out
    }

    #[test]
    fn test_range_iteration() {
        assert_eq!(drain(IterState::range(0, 3, 1)), vec!["0", "1", "2"]);
        assert_eq!(drain(IterState::range(5, 0, -2)), vec!["5", "3", "1"]);
        assert!(drain(IterState::range(3, 3, 1)).is_empty());
        assert_eq!(drain(IterState::range(i64::MAX - 1, i64::MAX, 5)).len(), 1);
    }

    #[test]
    fn test_list_iterator_sees_appends() {
        let list = Arc::new(Mutex::new(vec![Value::Int(1)]));
        let mut it = IterState::List {
            list: list.clone(),
            index: 0,
        };
        assert!(it.next().is_some());
        list.lock().push(Value::Int(2));
        assert_eq!(it.next().and_then(|v| v.as_int()), Some(2));
        assert!(it.next().is_none());
    }

    #[test]
    fn test_str_iteration() {
        let it = IterState::Str {
            chars: "héj".chars().collect(),
            index: 0,
        };
        assert_eq!(drain(it), vec!["h", "é", "j"]);
    }
}
