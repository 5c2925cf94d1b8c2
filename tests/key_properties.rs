//! Property tests for cache key derivation.

use docket_cache::{Direction, DocumentRef, FilterOp, Query};
use proptest::prelude::*;

fn segment() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{1,12}"
}

fn op() -> impl Strategy<Value = FilterOp> {
    prop_oneof![
        Just(FilterOp::Eq),
        Just(FilterOp::Neq),
        Just(FilterOp::Lt),
        Just(FilterOp::Lte),
        Just(FilterOp::Gt),
        Just(FilterOp::Gte),
    ]
}

fn filters() -> impl Strategy<Value = Vec<(String, FilterOp, i64)>> {
    prop::collection::vec((segment(), op(), any::<i64>()), 0..5)
}

fn build(path: &str, filters: &[(String, FilterOp, i64)], limit: Option<usize>) -> Query {
    let mut query = Query::collection(path).unwrap();
    for (field, op, value) in filters {
        query = query.where_field(field.clone(), *op, *value);
    }
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    query
}

proptest! {
    #[test]
    fn prop_rebuilt_query_has_same_key(
        path in segment(),
        filters in filters(),
        limit in prop::option::of(1usize..500),
    ) {
        let a = build(&path, &filters, limit);
        let b = build(&path, &filters, limit);
        prop_assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn prop_filter_order_is_irrelevant(
        path in segment(),
        filters in filters(),
    ) {
        let mut reversed = filters.clone();
        reversed.reverse();
        prop_assert_eq!(
            build(&path, &filters, None).cache_key(),
            build(&path, &reversed, None).cache_key()
        );
    }

    #[test]
    fn prop_different_paths_never_collide(
        a in segment(),
        b in segment(),
        filters in filters(),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(
            build(&a, &filters, None).cache_key(),
            build(&b, &filters, None).cache_key()
        );
    }

    #[test]
    fn prop_different_filter_values_never_collide(
        path in segment(),
        field in segment(),
        x in any::<i64>(),
        y in any::<i64>(),
    ) {
        prop_assume!(x != y);
        let a = build(&path, &[(field.clone(), FilterOp::Eq, x)], None);
        let b = build(&path, &[(field, FilterOp::Eq, y)], None);
        prop_assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn prop_order_direction_matters(path in segment(), field in segment()) {
        let asc = Query::collection(&path).unwrap().order_by(field.clone(), Direction::Asc);
        let desc = Query::collection(&path).unwrap().order_by(field, Direction::Desc);
        prop_assert_ne!(asc.cache_key(), desc.cache_key());
    }

    #[test]
    fn prop_document_key_is_path(collection in segment(), id in segment()) {
        let doc = DocumentRef::new(&format!("{collection}/{id}")).unwrap();
        let key = doc.cache_key();
        prop_assert_eq!(key.as_str(), format!("{collection}/{id}"));
        prop_assert_eq!(doc.id(), id.as_str());
    }
}
