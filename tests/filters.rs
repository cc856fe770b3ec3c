use std::cell::Cell;

use roaring::RoaringBitmap;
use segment_scan::filter::{ValueMatcher, ValueMatcherFactory};
use segment_scan::index::{BitmapIndex, BitmapIndexBuilder, BitmapIndexSelector};
use segment_scan::{BoundFilter, Filter};

/// 维度 d 上：x → {1,3,5,7}，y → {3,5,9}
struct Fixture {
    index: BitmapIndex,
}

impl Fixture {
    fn new() -> Self {
        let mut b = BitmapIndexBuilder::new();
        for row in [1, 3, 5, 7] {
            b.add("x", row);
        }
        for row in [3, 5, 9] {
            b.add("y", row);
        }
        Self { index: b.build() }
    }
}

impl BitmapIndexSelector for Fixture {
    fn num_rows(&self) -> u32 { 10 }

    fn bitmap_index(&self, dimension: &str) -> Option<&BitmapIndex> {
        (dimension == "d").then_some(&self.index)
    }
}

fn rows(bitmap: &RoaringBitmap) -> Vec<u32> {
    bitmap.iter().collect()
}

#[test]
fn and_intersects_or_unions_not_complements() {
    let fx = Fixture::new();
    let x = Filter::selector("d", "x");
    let y = Filter::selector("d", "y");

    let and = Filter::and(vec![x.clone(), y.clone()]);
    assert!(and.supports_bitmap_index(&fx));
    assert_eq!(rows(&and.evaluate_as_bitmap(&fx)), vec![3, 5]);

    let or = Filter::or(vec![x.clone(), y]);
    assert_eq!(rows(&or.evaluate_as_bitmap(&fx)), vec![1, 3, 5, 7, 9]);

    let not = Filter::not(x.clone());
    assert_eq!(rows(&not.evaluate_as_bitmap(&fx)), vec![0, 2, 4, 6, 8, 9]);

    let single = Filter::and(vec![x.clone()]);
    assert_eq!(single.evaluate_as_bitmap(&fx), x.evaluate_as_bitmap(&fx));
}

#[test]
fn missing_value_or_dimension_gives_empty_set() {
    let fx = Fixture::new();
    assert!(Filter::selector("d", "zzz").evaluate_as_bitmap(&fx).is_empty());
    assert!(!Filter::selector("other", "x").supports_bitmap_index(&fx));
    assert!(fx.bitmap_for("other", "x").is_empty());
}

#[test]
fn zero_ary_and_differs_between_paths() {
    let fx = Fixture::new();
    let empty = Filter::and(vec![]);
    assert_eq!(empty.evaluate_as_bitmap(&fx).len(), 10);

    struct NoFactory;
    impl<'a> ValueMatcherFactory<'a> for NoFactory {
        fn make_value_matcher(&self, _: &str, _: &str) -> ValueMatcher<'a> {
            ValueMatcher::Constant(true)
        }
        fn make_predicate_matcher(&self, _: &str, _: Box<dyn Fn(&str) -> bool + 'a>) -> ValueMatcher<'a> {
            ValueMatcher::Constant(true)
        }
    }
    assert!(!empty.make_matcher(&NoFactory).matches());
}

#[test]
fn and_matcher_stops_at_first_false() {
    let evaluated = Cell::new(0);
    let counter = &evaluated;
    let counted = move |result: bool| {
        ValueMatcher::Predicate(Box::new(move || {
            counter.set(counter.get() + 1);
            result
        }))
    };
    let m = ValueMatcher::And(vec![counted(true), counted(false), counted(true)]);
    assert!(!m.matches());
    assert_eq!(evaluated.get(), 2);
}

#[test]
fn bound_filter_over_bitmaps() {
    let fx = Fixture::new();
    let f: Filter = BoundFilter::new("d", Some("x"), None, true, false, "lexicographic").unwrap().into();
    assert!(f.supports_bitmap_index(&fx));
    assert_eq!(rows(&f.evaluate_as_bitmap(&fx)), vec![3, 5, 9]);
}
