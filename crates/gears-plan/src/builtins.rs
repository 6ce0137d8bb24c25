//! Callbacks backing the builder's aggregation helpers

use gears_core::{CallbackError, CallbackRegistry, CallbackResult, Record};

pub const COUNT_LOCAL: &str = "__count_local";
pub const SUM: &str = "__sum";
pub const KEY_FIELD: &str = "__key_field";
pub const COUNT_REDUCER: &str = "__count_reducer";
pub const SUM_REDUCER: &str = "__sum_reducer";
pub const AVG_LOCAL: &str = "__avg_local";
pub const AVG_MERGE: &str = "__avg_merge";
pub const AVG_FINISH: &str = "__avg_finish";
pub const DISTINCT_LOCAL: &str = "__distinct_local";
pub const DISTINCT_MERGE: &str = "__distinct_merge";
pub const FLATTEN: &str = "__flatten";

fn add(a: &Record, b: &Record) -> CallbackResult<Record> {
    match (a, b) {
        (Record::Null, other) | (other, Record::Null) => Ok(other.clone()),
        (Record::Int(x), Record::Int(y)) => Ok(Record::Int(x + y)),
        _ => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => Ok(Record::Float(x + y)),
            _ => Err(CallbackError(format!("can not add {} and {}", a, b))),
        },
    }
}

fn avg_pair(r: &Record) -> CallbackResult<(f64, i64)> {
    match r {
        Record::List(items) if items.len() == 2 => {
            let sum = items[0].as_float();
            let count = items[1].as_int();
            sum.zip(count)
                .ok_or_else(|| CallbackError::new("malformed average accumulator"))
        }
        Record::Null => Ok((0.0, 0)),
        _ => Err(CallbackError::new("malformed average accumulator")),
    }
}

fn pair(sum: f64, count: i64) -> Record {
    Record::List(vec![Record::Float(sum), Record::Int(count)])
}

fn push_unique(list: &mut Vec<Record>, record: Record) {
    if !list.contains(&record) {
        list.push(record);
    }
}

/// Register the builtin callbacks used by the builder helpers
pub fn register_builtins(registry: &CallbackRegistry) {
    registry.register_accumulate(COUNT_LOCAL, |_, a, _| {
        Ok(Record::Int(a.as_int().unwrap_or(0) + 1))
    });
    registry.register_accumulate(SUM, |_, a, r| add(&a, &r));
    registry.register_extractor(KEY_FIELD, |_, r| {
        r.get("key")
            .map(Record::group_key)
            .ok_or_else(|| CallbackError::new("record has no key field"))
    });
    registry.register_reducer(COUNT_REDUCER, |_, _, a, _| {
        Ok(Record::Int(a.as_int().unwrap_or(0) + 1))
    });
    registry.register_reducer(SUM_REDUCER, |_, _, a, r| add(&a, &r));
    registry.register_accumulate(AVG_LOCAL, |_, a, r| {
        let (sum, count) = avg_pair(&a)?;
        let value = r
            .as_float()
            .ok_or_else(|| CallbackError(format!("can not average {}", r)))?;
        Ok(pair(sum + value, count + 1))
    });
    registry.register_accumulate(AVG_MERGE, |_, a, r| {
        let (s1, c1) = avg_pair(&a)?;
        let (s2, c2) = avg_pair(&r)?;
        Ok(pair(s1 + s2, c1 + c2))
    });
    registry.register_map(AVG_FINISH, |_, r| {
        let (sum, count) = avg_pair(&r)?;
        if count == 0 {
            return Err(CallbackError::new("average of no values"));
        }
        Ok(Record::Float(sum / count as f64))
    });
    registry.register_accumulate(DISTINCT_LOCAL, |_, a, r| {
        let mut list = match a {
            Record::List(items) => items,
            _ => Vec::new(),
        };
        push_unique(&mut list, r);
        Ok(Record::List(list))
    });
    registry.register_accumulate(DISTINCT_MERGE, |_, a, r| {
        let mut list = match a {
            Record::List(items) => items,
            _ => Vec::new(),
        };
        if let Record::List(items) = r {
            for item in items {
                push_unique(&mut list, item);
            }
        }
        Ok(Record::List(list))
    });
    registry.register_flat_map(FLATTEN, |_, r| match r {
        Record::List(items) => Ok(items),
        other => Ok(vec![other]),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add() {
        assert_eq!(add(&Record::Int(1), &Record::Int(2)).unwrap(), Record::Int(3));
        assert_eq!(
            add(&Record::Int(1), &Record::Float(0.5)).unwrap(),
            Record::Float(1.5)
        );
        assert_eq!(add(&Record::Null, &Record::Int(4)).unwrap(), Record::Int(4));
        assert!(add(&Record::from("a"), &Record::Int(1)).is_err());
    }

    #[test]
    fn test_builtins_registered() {
        let registry = CallbackRegistry::new();
        register_builtins(&registry);
        for name in [COUNT_LOCAL, SUM, KEY_FIELD, AVG_FINISH, DISTINCT_MERGE, FLATTEN] {
            assert!(registry.contains(name), "{} missing", name);
        }
    }

    #[test]
    fn test_avg_pair() {
        assert_eq!(avg_pair(&pair(3.0, 2)).unwrap(), (3.0, 2));
        assert_eq!(avg_pair(&Record::Null).unwrap(), (0.0, 0));
        assert!(avg_pair(&Record::Int(1)).is_err());
    }
}
