use segment_scan::{
    ByteOrder, ColumnOptions, CompressedColumn, CompressedColumnBuilder, CompressionType,
    EngineError,
};

const VALUES: [f32; 16] = [
    0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 0.10, 0.11, 0.12, 0.13, 0.14, 0.15,
];

fn v(i: usize) -> f32 { VALUES[i] }

fn sixteen() -> CompressedColumnBuilder<f32> {
    let mut b = CompressedColumnBuilder::new(ColumnOptions::default().with_chunk_size(5)).unwrap();
    for (i, &x) in VALUES.iter().enumerate() {
        assert_eq!(b.add(x).unwrap(), i);
    }
    b
}

#[test]
fn random_access_across_chunk_boundaries() {
    let b = sixteen();
    assert_eq!(b.size(), 16);
    for i in 0..16 {
        assert_eq!(b.get(i).unwrap(), v(i));
    }

    let mut out = [0f32; 3];
    b.fill(7, &mut out).unwrap();
    assert_eq!(out, [v(7), v(8), v(9)]);

    let mut out = [-1f32; 10];
    let err = b.fill(7, &mut out).unwrap_err();
    assert!(matches!(err, EngineError::OutOfRange { index: 7, len: 10, size: 16 }));
    assert!(out.iter().all(|&v| v == -1.0));

    assert!(matches!(b.get(16), Err(EngineError::OutOfRange { .. })));
}

#[test]
fn fill_spans_match_sequential_reads() {
    let spans = [(0, 16), (3, 6), (7, 7), (7, 9)];
    let b = sixteen();
    for (start, len) in spans {
        let mut out = vec![0f32; len];
        b.fill(start, &mut out).unwrap();
        assert_eq!(out, VALUES[start..start + len].to_vec(), "builder fill {start}+{len}");
    }

    let col = b.freeze().unwrap();
    let mut view = col.to_queryable_view().unwrap();
    for (start, len) in spans {
        let sequential: Vec<f32> = (start..start + len).map(|i| col.get(i).unwrap()).collect();
        assert_eq!(sequential, VALUES[start..start + len].to_vec(), "get {start}+{len}");

        let mut out = vec![0f32; len];
        col.fill(start, &mut out).unwrap();
        assert_eq!(out, sequential, "column fill {start}+{len}");

        let mut out = vec![0f32; len];
        view.fill(start, &mut out).unwrap();
        assert_eq!(out, sequential, "view fill {start}+{len}");
    }
    view.close().unwrap();
}

#[test]
fn view_matches_builder_and_frozen_column() {
    let b = sixteen();
    let mut view = b.to_queryable_view().unwrap();
    for i in 0..16 {
        assert_eq!(view.get(i).unwrap(), b.get(i).unwrap());
    }
    let mut span = [0f32; 9];
    view.fill(4, &mut span).unwrap();
    let expected: Vec<f32> = (4..13).map(v).collect();
    assert_eq!(span.to_vec(), expected);
    view.close().unwrap();

    let col = b.freeze().unwrap();
    assert_eq!(col.chunk_count(), 4);
    assert_eq!(col.get(15).unwrap(), v(15));
    let mut tail = [0f32; 6];
    col.fill(10, &mut tail).unwrap();
    assert_eq!(tail.to_vec(), (10..16).map(v).collect::<Vec<_>>());
}

#[test]
fn options_are_honoured_on_both_orders_and_codecs() {
    let values: Vec<i64> = (0..100).map(|i| i * 1_000 - 7).collect();
    for order in [ByteOrder::Little, ByteOrder::Big] {
        for codec in [CompressionType::None, CompressionType::Lz4] {
            let opts = ColumnOptions::default()
                .with_chunk_size(32)
                .with_byte_order(order)
                .with_compression(codec);
            let col = CompressedColumn::from_values(&values, opts).unwrap();
            let back = CompressedColumn::<i64>::from_bytes(&col.to_bytes()).unwrap();
            assert_eq!(back.options().byte_order, order);
            let mut all = vec![0i64; 100];
            back.fill(0, &mut all).unwrap();
            assert_eq!(all, values);
        }
    }
}

#[test]
fn corrupted_column_bytes_are_rejected() {
    let col = CompressedColumn::from_values(&[1.0f64, 2.0, 3.0], ColumnOptions::default()).unwrap();
    let mut bytes = col.to_bytes();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x5a;
    assert!(CompressedColumn::<f64>::from_bytes(&bytes).is_err());
    // 类型不符
    assert!(CompressedColumn::<f32>::from_bytes(&col.to_bytes()).is_err());
}

#[test]
fn concurrent_views_share_one_column() {
    let values: Vec<f32> = (0..1_000).map(|i| i as f32 * 0.5).collect();
    let col = CompressedColumn::from_values(&values, ColumnOptions::default().with_chunk_size(64)).unwrap();

    std::thread::scope(|s| {
        for t in 0..4usize {
            let col = &col;
            s.spawn(move || {
                let mut view = col.to_queryable_view().unwrap();
                for i in (t..1_000).step_by(7) {
                    assert_eq!(view.get(i).unwrap(), i as f32 * 0.5);
                }
                view.close().unwrap();
            });
        }
    });
    assert!(col.idle_buffers() >= 1);
}
