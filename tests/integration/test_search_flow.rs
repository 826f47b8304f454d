//! Searches against indexes built on disk: caching across engines,
//! re-index invalidation and the HNSW candidate path.

use super::common::TestProject;
use super::common::sample_code::{CALC_PY, FOO_JS, INVOICE_GO, MATH_PY, TAX_GO, VAT_GO};
use clindex::search::{CacheLevel, SearchOptions};
use clindex::{SearchQuery, SearchType};

#[test]
fn test_repeated_search_is_served_from_l1() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.index();

    let engine = project.engine();
    let query = SearchQuery::new("calculateTax");
    let first = engine.search(&query).unwrap();
    let second = engine.search(&query).unwrap();

    assert_eq!(first.results, second.results);
    assert!(second.cached);
    assert!(second.execution_time < first.execution_time);
    let stats = engine.cache_stats().unwrap();
    assert_eq!(stats.l1_hits, 1);
    assert_eq!(stats.total_queries, 2);
}

#[test]
fn test_second_engine_hits_l2() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.index();
    let query = SearchQuery::new("calculateTax");

    let first = project.engine().search(&query).unwrap();
    let engine = project.engine();
    let cache = engine.cache().unwrap();
    assert!(matches!(cache.get(&query), Some((_, CacheLevel::L2))));
    let second = engine.search(&query).unwrap();
    assert_eq!(first.results, second.results);
    assert!(second.cached);
}

#[test]
fn test_reindex_invalidates_persistent_cache() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.index();
    let query = SearchQuery::new("calculateVAT");
    assert!(project.engine().search(&query).unwrap().is_empty());

    project.append("f.go", VAT_GO);
    project.index();

    let results = project.engine().search(&query).unwrap();
    assert!(!results.cached);
    assert_eq!(results.len(), 1);
    assert_eq!(results.results[0].start_line, 3);
}

#[test]
fn test_force_bypasses_cache() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.index();
    let engine = project.engine();
    let query = SearchQuery::new("calculateTax");
    engine.search(&query).unwrap();

    let options = SearchOptions {
        bypass_cache: true,
        ..SearchOptions::default()
    };
    assert!(!engine.search_with(&query, &options).unwrap().cached);
}

#[test]
fn test_scores_bounded_and_sorted() {
    let project = TestProject::new();
    project.add_file("calc.go", TAX_GO);
    project.add_file("inv.go", INVOICE_GO);
    project.add_file("a.js", FOO_JS);
    project.add_file("m.py", CALC_PY);
    project.add_file("math_utils.py", MATH_PY);
    project.index();
    let engine = project.engine();

    let queries = [
        SearchQuery::new("calculate tax").search_type(SearchType::Semantic).threshold(0.0),
        SearchQuery::new("return").search_type(SearchType::Text),
        SearchQuery::new("a").search_type(SearchType::Text).max_results(100),
        SearchQuery::new(r"\w+\(").search_type(SearchType::Regex).max_results(100),
        SearchQuery::new("total").search_type(SearchType::Fuzzy).threshold(0.0),
        SearchQuery::new("TODO"),
        SearchQuery::new("amount float64").max_results(50),
    ];
    for query in queries {
        let results = engine.search(&query).unwrap();
        for pair in results.results.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let ordered = a.relevance_score > b.relevance_score
                || (a.relevance_score == b.relevance_score
                    && (a.file_path.as_str(), a.start_line) <= (b.file_path.as_str(), b.start_line));
            assert!(ordered, "{query:?}: {a:?} before {b:?}");
        }
        for (i, result) in results.results.iter().enumerate() {
            assert!((0.0..=1.0).contains(&result.relevance_score), "{result:?}");
            assert_eq!(result.rank, i + 1);
        }
        assert!(results.len() <= query.max_results);
    }
}

#[test]
fn test_hnsw_path_agrees_with_exact_scan() {
    let project = TestProject::new();
    for i in 0..12 {
        project.add_file(
            &format!("pkg/file{i}.go"),
            &format!("package pkg\n\nfunc handler{i}(value int) int {{\n\treturn value + {i}\n}}\n"),
        );
    }
    project.add_file("calc.go", TAX_GO);
    project.index();

    let query = SearchQuery::new("calculate tax")
        .search_type(SearchType::Semantic)
        .threshold(0.5)
        .max_results(3);

    let exact = project.engine().search(&query).unwrap();

    let mut settings = project.settings();
    settings.search.hnsw_min_vectors = 1;
    settings.cache.enabled = false;
    let engine = clindex::SearchEngine::open(project.path(), settings).unwrap();
    let approximate = engine.search(&query).unwrap();
    assert!(engine.index().unwrap().snapshot().hnsw().is_some());

    assert_eq!(exact.results[0].file_path, "calc.go");
    assert_eq!(approximate.results[0].file_path, "calc.go");
    assert!((exact.results[0].relevance_score - approximate.results[0].relevance_score).abs() < 1e-5);
}

#[test]
fn test_language_and_glob_scope() {
    let project = TestProject::new();
    project.add_file("src/calc.go", TAX_GO);
    project.add_file("web/a.js", FOO_JS);
    project.add_file("m.py", CALC_PY);
    project.index();
    let engine = project.engine();

    let query = SearchQuery::new("(").search_type(SearchType::Text).max_results(100);
    let all = engine.search(&query).unwrap();
    assert_eq!(all.searched_files, 3);

    let go_only = engine.search(&query.clone().file_pattern("src/**")).unwrap();
    assert_eq!(go_only.searched_files, 1);
    assert!(go_only.results.iter().all(|r| r.file_path == "src/calc.go"));

    let python = engine.search(&query.clone().language(clindex::Language::Python)).unwrap();
    assert!(!python.is_empty());
    assert!(python.results.iter().all(|r| r.file_path == "m.py"));
}
