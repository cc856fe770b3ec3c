//! # segment-scan 使用案例
//!
//! 1. 从内存行源构建段（一个维度不建索引）
//! 2. 段写入字节并重新打开
//! 3. 随机访问压缩度量列
//! 4. 位图路径 / 逐行路径过滤 + 聚合
//! 5. 按维度分组 + 直方图 + 后聚合
//! 6. 多段并发扫描

use segment_scan::{
    run_query, scan_segments, AggValue, AggregatorSpec, BoundFilter, CancellationToken,
    ColumnOptions, Filter, MapBasedRow, PostAggregator, Query, QueryOptions, Segment,
    SegmentBuilder, SegmentOptions, VecRowSource,
};

fn events() -> Vec<MapBasedRow> {
    let pages = ["home", "search", "cart", "home", "checkout", "search", "home", "cart"];
    let hosts = ["web-1", "web-2", "web-1", "web-3", "web-2", "web-1", "web-3", "web-2"];
    pages.iter().zip(hosts.iter()).enumerate()
        .map(|(i, (page, host))| {
            MapBasedRow::new(1_700_000_000_000 + i as i64 * 1_000, &["page", "host"])
                .with("page", *page)
                .with("host", *host)
                .with("latency", 10.0 + i as f64 * 7.5)
                .with("bytes", 512.0 * (i + 1) as f64)
        })
        .collect()
}

fn main() -> segment_scan::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("═══════════════════════════════════════════════════════════");
    println!("   segment-scan 演示                                       ");
    println!("═══════════════════════════════════════════════════════════\n");

    // =========================================================================
    // 1. 构建段
    // =========================================================================
    println!("【1】构建段 ...");
    let options = SegmentOptions::new(&["latency", "bytes"])
        .with_column_options(ColumnOptions::default().with_chunk_size(3))
        .without_index("host");
    let mut builder = SegmentBuilder::new(options)?;
    let added = builder.add_all(&mut VecRowSource::new(events()))?;
    let segment = builder.build()?;
    println!("    rows = {added}, dimensions = {:?}\n", segment.dimension_names().collect::<Vec<_>>());

    // =========================================================================
    // 2. 写出并重新打开
    // =========================================================================
    println!("【2】段写入字节并重新打开 ...");
    let mut bytes = Vec::new();
    let written = segment.write_to(&mut bytes)?;
    let segment = Segment::open(&bytes)?;
    println!("    {written} bytes, reopened rows = {}\n", segment.num_rows());

    // =========================================================================
    // 3. 随机访问
    // =========================================================================
    println!("【3】随机访问 latency 列 ...");
    if let Some(latency) = segment.metric("latency") {
        let mut view = latency.to_queryable_view()?;
        let mut window = [0f32; 4];
        view.fill(2, &mut window)?;
        println!("    chunks = {}, get(5) = {}, fill(2, 4) = {window:?}", latency.chunk_count(), view.get(5)?);
        view.close()?;
    }
    println!();

    // =========================================================================
    // 4. 过滤 + 聚合
    // =========================================================================
    println!("【4】过滤聚合 ...");
    let cancel = CancellationToken::new();
    let totals = Query::new(vec![
        AggregatorSpec::count("rows"),
        AggregatorSpec::double_sum("latency_sum", "latency"),
        AggregatorSpec::max("latency_max", "latency"),
    ]);

    let indexed = totals.clone()
        .with_filter(Filter::or(vec![Filter::selector("page", "home"), Filter::selector("page", "cart")]));
    for row in run_query(&segment, &indexed, &QueryOptions::default(), &cancel)? {
        println!("    page in (home, cart)       → {:?}", row.metrics);
    }

    let unindexed = totals.clone()
        .with_filter(Filter::and(vec![
            Filter::selector("host", "web-1"),
            BoundFilter::new("page", Some("d"), None, false, false, "lexicographic")?.into(),
        ]));
    for row in run_query(&segment, &unindexed, &QueryOptions::default(), &cancel)? {
        println!("    host=web-1 and page >= d   → {:?}", row.metrics);
    }
    println!();

    // =========================================================================
    // 5. 分组 + 直方图 + 后聚合
    // =========================================================================
    println!("【5】按 page 分组 ...");
    let grouped = Query::new(vec![
        AggregatorSpec::count("rows"),
        AggregatorSpec::double_sum("latency_sum", "latency"),
        AggregatorSpec::histogram("latency_hist", "latency", vec![20.0, 40.0])?,
    ])
    .with_group_by("page")
    .with_post_aggregator(PostAggregator::arithmetic("avg_latency", "/", vec![
        PostAggregator::field_access("s", "latency_sum"),
        PostAggregator::field_access("n", "rows"),
    ])?);
    for row in run_query(&segment, &grouped, &QueryOptions::default().with_batch_size(2), &cancel)? {
        let avg = row.metrics.get("avg_latency").and_then(AggValue::as_f64).unwrap_or_default();
        let hist = row.metrics.get("latency_hist").map(ToString::to_string).unwrap_or_default();
        println!("    {:<10} avg = {avg:>6.2}  {hist}", row.key.as_deref().unwrap_or("<none>"));
    }
    println!();

    // =========================================================================
    // 6. 并发扫描
    // =========================================================================
    println!("【6】并发扫描 3 个段 ...");
    let segments = vec![segment.clone(), segment.clone(), segment];
    let per_segment = scan_segments(&segments, &totals, &QueryOptions::default(), &cancel)?;
    for (i, rows) in per_segment.iter().enumerate() {
        println!("    segment {i}: {:?}", rows[0].metrics.get("rows"));
    }

    println!("\n═══════════════════════════════════════════════════════════");
    println!("   演示完成");
    println!("═══════════════════════════════════════════════════════════");
    Ok(())
}
