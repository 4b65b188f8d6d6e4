// tests/ingest_normalize.rs
use job_leads_collector::ingest::fingerprint::FingerprintPolicy;
use job_leads_collector::ingest::normalize::Normalizer;
use job_leads_collector::ingest::providers::feed::parse_category_page;
use job_leads_collector::ingest::types::{
    BrowserPosting, FeedPost, RawListing, SearchHit, SourceKind,
};

fn search_hit() -> SearchHit {
    SearchHit {
        id: Some("in-123".into()),
        site: Some("Indeed".into()),
        job_url: Some("https://www.indeed.com/viewjob?jk=abc123".into()),
        title: Some("  Rust&nbsp;Developer ".into()),
        company: Some("Acme".into()),
        location: Some("Austin, TX".into()),
        date_posted: Some("2025-03-01".into()),
        interval: Some("YEARLY".into()),
        min_amount: Some(120_000.0),
        max_amount: Some(150_000.0),
        currency: Some("USD".into()),
        is_remote: Some(false),
        description: Some("<p>Build &amp; ship</p>".into()),
        emails: None,
        search_term: Some("rust developer".into()),
        ..SearchHit::default()
    }
}

#[test]
fn normalize_is_deterministic() {
    let n = Normalizer::default();
    let raw = RawListing::Search(search_hit());
    let a = n.normalize(&raw).unwrap();
    let b = n.normalize(&raw).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.fingerprint.len(), 64);
}

#[test]
fn search_hit_maps_every_field() {
    let job = Normalizer::default()
        .normalize(&RawListing::Search(search_hit()))
        .unwrap();
    assert_eq!(job.source, SourceKind::Search);
    assert_eq!(job.title, "Rust Developer");
    assert_eq!(job.company.as_deref(), Some("Acme"));
    assert_eq!(job.salary_min, Some(120_000));
    assert_eq!(job.salary_max, Some(150_000));
    assert_eq!(job.salary_interval.as_deref(), Some("yearly"));
    assert_eq!(job.site.as_deref(), Some("indeed"));
    assert_eq!(job.description.as_deref(), Some("Build & ship"));
    assert_eq!(
        job.posted_at.map(|d| d.to_rfc3339()).as_deref(),
        Some("2025-03-01T00:00:00+00:00")
    );
    assert_eq!(job.raw_payload["shape"], "search");
}

#[test]
fn missing_title_is_malformed() {
    let hit = SearchHit {
        title: Some("   ".into()),
        ..search_hit()
    };
    let err = Normalizer::default()
        .normalize(&RawListing::Search(hit))
        .unwrap_err();
    assert_eq!(err.source_kind, SourceKind::Search);
    assert!(err.reason.contains("title"));
    assert_eq!(err.to_string(), "malformed search record: missing title");
    assert!(std::error::Error::source(&err).is_none());

    let post = FeedPost {
        category: "/technologies/rust".into(),
        body_text: " \n ".into(),
        ..FeedPost::default()
    };
    assert!(Normalizer::default()
        .normalize(&RawListing::Feed(post))
        .is_err());
}

#[test]
fn feed_fixture_posts_normalize() {
    let html = include_str!("fixtures/feed_rust.html");
    let posts = parse_category_page(html, "/technologies/rust");
    assert_eq!(posts.len(), 3);

    let n = Normalizer::default();
    let jobs: Vec<_> = posts
        .iter()
        .map(|p| n.normalize(&RawListing::Feed(p.clone())).unwrap())
        .collect();

    assert_eq!(jobs[0].title, "Senior Rust Engineer");
    assert_eq!(jobs[0].company.as_deref(), Some("Acme Corp"));
    assert_eq!(jobs[0].salary_min, Some(150_000));
    assert_eq!(jobs[0].salary_max, Some(180_000));
    assert_eq!(jobs[0].is_remote, Some(true));
    assert_eq!(jobs[0].emails, vec!["jobs@acme.test"]);

    assert_eq!(jobs[1].title, "Platform Engineer");
    assert_eq!(jobs[1].location.as_deref(), Some("Berlin, Germany"));
    assert_eq!(jobs[1].url.as_deref(), Some("https://globex.test/jobs/42"));
    assert_eq!(jobs[1].salary_min, None);

    // no pipes: title falls back to the leading text, salary stays unknown
    assert!(jobs[2].title.starts_with("Initech is hiring"));
    assert_eq!(jobs[2].company, None);
    assert_eq!(jobs[2].salary_min, None);
}

#[test]
fn browser_posting_prefers_detail_title_and_requires_url() {
    let posting = BrowserPosting {
        url: "https://builtin.com/job/senior-rust-engineer/1001".into(),
        card_title: "Sr. Rust Eng".into(),
        detail_title: Some("Senior Rust Engineer".into()),
        company: Some("Initrode".into()),
        search_keyword: "Rust".into(),
        remote_search: true,
        salary_text: Some("160K-190K Annually".into()),
        tags: vec!["Fintech".into()],
        skills: vec!["Rust".into()],
        ..BrowserPosting::default()
    };
    let job = Normalizer::default()
        .normalize(&RawListing::Browser(posting.clone()))
        .unwrap();
    assert_eq!(job.title, "Senior Rust Engineer");
    assert_eq!(job.is_remote, Some(true));
    assert_eq!(job.salary_min, Some(160_000));
    assert_eq!(job.tags, vec!["Fintech", "Rust"]);
    assert_eq!(job.search_keyword.as_deref(), Some("Rust"));

    let no_url = BrowserPosting {
        url: " ".into(),
        ..posting
    };
    assert!(Normalizer::default()
        .normalize(&RawListing::Browser(no_url))
        .is_err());
}

#[test]
fn fingerprint_policy_changes_identity() {
    let a = search_hit();
    let b = SearchHit {
        job_url: Some("https://www.indeed.com/viewjob?jk=other".into()),
        ..search_hit()
    };
    let by_url = Normalizer::new(FingerprintPolicy::TitleCompanyUrl);
    let by_loc = Normalizer::new(FingerprintPolicy::TitleCompanyLocation);

    let fa = by_url.normalize(&RawListing::Search(a.clone())).unwrap();
    let fb = by_url.normalize(&RawListing::Search(b.clone())).unwrap();
    assert_ne!(fa.fingerprint, fb.fingerprint);

    let la = by_loc.normalize(&RawListing::Search(a)).unwrap();
    let lb = by_loc.normalize(&RawListing::Search(b)).unwrap();
    assert_eq!(la.fingerprint, lb.fingerprint);
}
