//! Flattened replay table
//!
//! All recorded results of a trace live in one vector. Every receiver owns a
//! contiguous range of it, grouped by operation in discovery order:
//!
//! ```text
//! operation without parameters:  [op, result]
//! operation with n parameters:   [op, k, (arg_1 .. arg_n, result) x k]
//! ```
//!
//! Lookups scan the receiver's range linearly and compare arguments with
//! `==`; the number of recorded calls per operation and receiver is small.

use indexmap::IndexMap;
use std::ops::Range;

use crate::provider::ProviderRef;
use crate::recorder::RecordedOperation;
use crate::special::ResultOrMarker;
use crate::value::{Operation, Value};

#[derive(Debug, Clone)]
enum Slot {
    Operation(Operation),
    Count(usize),
    Argument(Value),
    Result(ResultOrMarker),
}

/// Read-only table of recorded results
#[derive(Debug, Default)]
pub struct ReplayTable {
    slots: Vec<Slot>,
}

impl ReplayTable {
    /// Flatten `operations`, returning the table and each receiver's range
    pub fn build(operations: &[RecordedOperation]) -> (Self, Vec<(ProviderRef, Range<usize>)>) {
        let mut grouped: IndexMap<&ProviderRef, IndexMap<&Operation, Vec<&RecordedOperation>>> =
            IndexMap::new();
        for recorded in operations {
            grouped
                .entry(&recorded.receiver)
                .or_default()
                .entry(&recorded.operation)
                .or_default()
                .push(recorded);
        }

        let mut slots = Vec::new();
        let mut ranges = Vec::with_capacity(grouped.len());
        for (receiver, by_operation) in grouped {
            let begin = slots.len();
            for (operation, calls) in by_operation {
                slots.push(Slot::Operation(operation.clone()));
                if operation.param_count() == 0 {
                    // keys are unique, so there is exactly one call
                    if let Some(call) = calls.last() {
                        slots.push(Slot::Result(call.result.clone()));
                    }
                    continue;
                }
                slots.push(Slot::Count(calls.len()));
                for call in calls {
                    slots.extend(call.args.iter().cloned().map(Slot::Argument));
                    slots.push(Slot::Result(call.result.clone()));
                }
            }
            ranges.push((receiver.clone(), begin..slots.len()));
        }
        (Self { slots }, ranges)
    }

    /// Recorded result of `operation` with `args` within `range`
    pub fn find_result(
        &self,
        range: &Range<usize>,
        operation: &Operation,
        args: &[Value],
    ) -> Option<&ResultOrMarker> {
        let mut cursor = range.start;
        while cursor < range.end {
            let Slot::Operation(found) = self.slots.get(cursor)? else {
                return None;
            };
            let params = found.param_count();
            if params == 0 {
                if found == operation && args.is_empty() {
                    return self.result_at(cursor + 1);
                }
                cursor += 2;
                continue;
            }
            let Slot::Count(count) = self.slots.get(cursor + 1)? else {
                return None;
            };
            let first = cursor + 2;
            let stride = params + 1;
            if found == operation {
                return (0..*count)
                    .map(|i| first + i * stride)
                    .find(|&base| self.arguments_match(base, args))
                    .and_then(|base| self.result_at(base + params));
            }
            cursor = first + count * stride;
        }
        None
    }

    /// Argument vectors of the first operation run within `range` whose
    /// name is `name`
    pub fn recorded_argument_sets(&self, range: &Range<usize>, name: &str) -> Vec<Vec<Value>> {
        let mut cursor = range.start;
        while cursor < range.end {
            let Some(Slot::Operation(found)) = self.slots.get(cursor) else {
                return Vec::new();
            };
            let params = found.param_count();
            if params == 0 {
                if found.name() == name {
                    return vec![Vec::new()];
                }
                cursor += 2;
                continue;
            }
            let Some(Slot::Count(count)) = self.slots.get(cursor + 1) else {
                return Vec::new();
            };
            let first = cursor + 2;
            let stride = params + 1;
            if found.name() == name {
                return (0..*count)
                    .map(|i| {
                        let base = first + i * stride;
                        (base..base + params)
                            .filter_map(|slot| match self.slots.get(slot) {
                                Some(Slot::Argument(arg)) => Some(arg.clone()),
                                _ => None,
                            })
                            .collect()
                    })
                    .collect();
            }
            cursor = first + count * stride;
        }
        Vec::new()
    }

    fn arguments_match(&self, base: usize, args: &[Value]) -> bool {
        args.iter().enumerate().all(|(i, arg)| {
            matches!(self.slots.get(base + i), Some(Slot::Argument(recorded)) if recorded == arg)
        })
    }

    fn result_at(&self, index: usize) -> Option<&ResultOrMarker> {
        match self.slots.get(index) {
            Some(Slot::Result(result)) => Some(result),
            _ => None,
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubProvider;
    use crate::value::{ThrownError, TypeDescriptor};

    fn op(receiver: &ProviderRef, operation: &Operation, args: Vec<Value>, result: ResultOrMarker) -> RecordedOperation {
        RecordedOperation::new(receiver.clone(), operation.clone(), args, result)
    }

    #[test]
    fn test_layout_and_lookup() {
        let ty = TypeDescriptor::new("Resolver");
        let a = StubProvider::new(ty.clone(), "a").into_ref();
        let b = StubProvider::new(ty, "b").into_ref();
        let name = Operation::new("name", &[]);
        let lookup = Operation::new("lookup", &["int", "int"]);

        let operations = vec![
            op(&a, &lookup, vec![Value::Int(1), Value::Int(2)], ResultOrMarker::Value(Value::str("x"))),
            op(&b, &name, vec![], ResultOrMarker::Value(Value::str("B"))),
            op(&a, &name, vec![], ResultOrMarker::Value(Value::str("A"))),
            op(
                &a,
                &lookup,
                vec![Value::Int(3), Value::Int(4)],
                ResultOrMarker::from_thrown(ThrownError::new("LinkageError", None)),
            ),
        ];
        let (table, ranges) = ReplayTable::build(&operations);

        // a: [lookup, 2, 1, 2, x, 3, 4, err, name, A]; b: [name, B]
        assert_eq!(table.len(), 12);
        assert_eq!(ranges[0].0, a);
        assert_eq!(ranges[0].1, 0..10);
        assert_eq!(ranges[1].1, 10..12);

        let range_a = &ranges[0].1;
        assert_eq!(
            table.find_result(range_a, &name, &[]),
            Some(&ResultOrMarker::Value(Value::str("A")))
        );
        assert!(matches!(
            table.find_result(range_a, &lookup, &[Value::Int(3), Value::Int(4)]),
            Some(ResultOrMarker::Marker(_))
        ));
        assert_eq!(table.find_result(range_a, &lookup, &[Value::Int(9), Value::Int(4)]), None);
        assert_eq!(
            table.find_result(&ranges[1].1, &name, &[]),
            Some(&ResultOrMarker::Value(Value::str("B")))
        );
        assert_eq!(table.find_result(&ranges[1].1, &lookup, &[Value::Int(1), Value::Int(2)]), None);
    }

    #[test]
    fn test_recorded_argument_sets_reports_first_run() {
        let a = StubProvider::new(TypeDescriptor::new("Resolver"), "a").into_ref();
        let narrow = Operation::new("lookup", &["int"]);
        let wide = Operation::new("lookup", &["int", "int"]);
        let operations = vec![
            op(&a, &narrow, vec![Value::Int(1)], ResultOrMarker::Value(Value::Int(1))),
            op(&a, &narrow, vec![Value::Int(2)], ResultOrMarker::Value(Value::Int(2))),
            op(&a, &wide, vec![Value::Int(3), Value::Int(4)], ResultOrMarker::Value(Value::Int(7))),
        ];
        let (table, ranges) = ReplayTable::build(&operations);

        assert_eq!(
            table.recorded_argument_sets(&ranges[0].1, "lookup"),
            vec![vec![Value::Int(1)], vec![Value::Int(2)]]
        );
        assert!(table.recorded_argument_sets(&ranges[0].1, "missing").is_empty());
    }

    #[test]
    fn test_empty_range() {
        let table = ReplayTable::default();
        assert!(table.is_empty());
        assert_eq!(table.find_result(&(0..0), &Operation::new("x", &[]), &[]), None);
    }
}
