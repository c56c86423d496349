use atoms::Atom;
use engine::{Engine, QueryResult, Value};
use quads::QuadStore;
use std::collections::HashMap;

fn open_store() -> (tempfile::TempDir, QuadStore, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let store = QuadStore::open(dir.path()).unwrap();
    (dir, store, Engine::new())
}

fn add(store: &QuadStore, g: Atom, s: &str, p: &str, o: &str) {
    let s = store.atoms().intern(s).unwrap();
    let p = store.atoms().intern(p).unwrap();
    let o = store.atoms().intern(o).unwrap();
    store.add_current(g, s, p, o).unwrap();
}

fn rows(engine: &Engine, store: &QuadStore, query: &str) -> Vec<HashMap<String, Value>> {
    match engine.query(store, query).unwrap() {
        QueryResult::Solutions { variables, rows } => rows
            .into_iter()
            .map(|solution| {
                variables
                    .iter()
                    .cloned()
                    .zip(solution.values)
                    .filter_map(|(var, value)| value.map(|v| (var, v)))
                    .collect()
            })
            .collect(),
        other => panic!("expected solutions, got {other:?}"),
    }
}

fn ask(engine: &Engine, store: &QuadStore, query: &str) -> bool {
    match engine.query(store, query).unwrap() {
        QueryResult::Ask(b) => b,
        other => panic!("expected ASK result, got {other:?}"),
    }
}

#[test]
fn test_insert_and_read_back() {
    let (_dir, store, engine) = open_store();
    add(
        &store,
        Atom::DEFAULT_GRAPH,
        "<http://ex/a>",
        "<http://ex/p>",
        "\"hello\"",
    );

    let got = rows(
        &engine,
        &store,
        "SELECT ?o WHERE { <http://ex/a> <http://ex/p> ?o }",
    );
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["o"], Value::String("hello".to_string()));
}

#[test]
fn test_durability_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = QuadStore::open(dir.path()).unwrap();
        let s = store.atoms().intern("<http://ex/s>").unwrap();
        let p = store.atoms().intern("<http://ex/p>").unwrap();
        let o = store.atoms().intern("<http://ex/o>").unwrap();
        let mut batch = store.begin_batch().unwrap();
        batch.add_current(Atom::DEFAULT_GRAPH, s, p, o).unwrap();
        batch.commit().unwrap();
    }

    let store = QuadStore::open(dir.path()).unwrap();
    let engine = Engine::new();
    assert!(ask(
        &engine,
        &store,
        "ASK { <http://ex/s> <http://ex/p> <http://ex/o> }"
    ));
}

#[test]
fn test_rollback_leaves_count_zero() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = QuadStore::open(dir.path()).unwrap();
        let s = store.atoms().intern("<http://ex/s>").unwrap();
        let p = store.atoms().intern("<http://ex/p>").unwrap();
        let mut batch = store.begin_batch().unwrap();
        for i in 0..3 {
            let o = store.atoms().intern(&format!("\"{i}\"")).unwrap();
            batch.add_current(Atom::DEFAULT_GRAPH, s, p, o).unwrap();
        }
        batch.rollback();
    }

    let store = QuadStore::open(dir.path()).unwrap();
    let engine = Engine::new();
    let got = rows(
        &engine,
        &store,
        "SELECT (COUNT(*) AS ?n) WHERE { ?s ?p ?o }",
    );
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["n"], Value::Integer(0));
}

#[test]
fn test_temporal_point_in_time() {
    let (_dir, store, _engine) = open_store();
    let a = store.atoms().intern("<ex:a>").unwrap();
    let v = store.atoms().intern("<ex:v>").unwrap();
    let one = store.atoms().intern("\"1\"").unwrap();
    let two = store.atoms().intern("\"2\"").unwrap();
    let three = store.atoms().intern("\"3\"").unwrap();
    let g = Atom::DEFAULT_GRAPH;

    store.add(g, a, v, one, 1000, 2000).unwrap();
    store.add(g, a, v, two, 2000, 3000).unwrap();
    store.add(g, a, v, three, 3000, quads::FOREVER).unwrap();

    let pattern = quads::QuadPattern {
        graph: Some(g),
        subject: Some(a),
        predicate: Some(v),
        object: None,
    };
    let hits: Vec<_> = store.query_as_of(pattern, 2500).collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].object, two);
}

#[test]
fn test_join_with_filter() {
    let (_dir, store, engine) = open_store();
    let g = Atom::DEFAULT_GRAPH;
    let xsd_int = "^^<http://www.w3.org/2001/XMLSchema#integer>";
    add(&store, g, "<ex:alice>", "<ex:knows>", "<ex:bob>");
    add(&store, g, "<ex:bob>", "<ex:age>", &format!("\"42\"{xsd_int}"));
    add(&store, g, "<ex:alice>", "<ex:age>", &format!("\"30\"{xsd_int}"));

    let got = rows(
        &engine,
        &store,
        "SELECT ?f ?age WHERE { <ex:alice> <ex:knows> ?f . ?f <ex:age> ?age FILTER(?age > 40) }",
    );
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["f"], Value::Iri("ex:bob".to_string()));
    assert_eq!(got[0]["age"], Value::Integer(42));
}

#[test]
fn test_named_graph_enumeration() {
    let (_dir, store, _engine) = open_store();
    let g1 = store.atoms().intern("<g1>").unwrap();
    let g2 = store.atoms().intern("<g2>").unwrap();
    add(&store, g1, "<s>", "<p>", "<o>");
    add(&store, g2, "<s>", "<p>", "<o>");
    add(&store, Atom::DEFAULT_GRAPH, "<s>", "<p>", "<o>");

    let mut graphs: Vec<Atom> = store.named_graphs().collect();
    graphs.sort();
    let mut expected = vec![g1, g2];
    expected.sort();
    assert_eq!(graphs, expected);
}

#[test]
fn test_graph_clause_and_graph_variable() {
    let (_dir, store, engine) = open_store();
    let g1 = store.atoms().intern("<http://ex/g1>").unwrap();
    let g2 = store.atoms().intern("<http://ex/g2>").unwrap();
    add(&store, g1, "<http://ex/s>", "<http://ex/p>", "\"in-g1\"");
    add(&store, g2, "<http://ex/s>", "<http://ex/p>", "\"in-g2\"");
    add(&store, Atom::DEFAULT_GRAPH, "<http://ex/s>", "<http://ex/p>", "\"in-default\"");

    // Wildcard inside a specific graph sees only that graph.
    let got = rows(
        &engine,
        &store,
        "SELECT ?o WHERE { GRAPH <http://ex/g1> { ?s ?p ?o } }",
    );
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["o"], Value::String("in-g1".to_string()));

    // The default dataset excludes named graphs.
    let got = rows(&engine, &store, "SELECT ?o WHERE { ?s ?p ?o }");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["o"], Value::String("in-default".to_string()));

    // A graph variable ranges over the named graphs.
    let got = rows(
        &engine,
        &store,
        "SELECT ?g ?o WHERE { GRAPH ?g { ?s ?p ?o } }",
    );
    assert_eq!(got.len(), 2);
}

#[test]
fn test_optional_union_minus() {
    let (_dir, store, engine) = open_store();
    let g = Atom::DEFAULT_GRAPH;
    add(&store, g, "<http://e/a>", "<http://e/name>", "\"A\"");
    add(&store, g, "<http://e/b>", "<http://e/name>", "\"B\"");
    add(&store, g, "<http://e/a>", "<http://e/mail>", "\"a@x\"");

    // OPTIONAL keeps the unmatched row with the variable unbound.
    let got = rows(
        &engine,
        &store,
        "SELECT ?s ?mail WHERE { ?s <http://e/name> ?n OPTIONAL { ?s <http://e/mail> ?mail } }",
    );
    assert_eq!(got.len(), 2);
    let with_mail = got.iter().filter(|r| r.contains_key("mail")).count();
    assert_eq!(with_mail, 1);

    // UNION yields both branches.
    let got = rows(
        &engine,
        &store,
        "SELECT ?v WHERE { { ?s <http://e/name> ?v } UNION { ?s <http://e/mail> ?v } }",
    );
    assert_eq!(got.len(), 3);

    // MINUS removes solutions with a compatible inner match.
    let got = rows(
        &engine,
        &store,
        "SELECT ?s WHERE { ?s <http://e/name> ?n MINUS { ?s <http://e/mail> ?m } }",
    );
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["s"], Value::Iri("http://e/b".to_string()));
}

#[test]
fn test_bind_and_values() {
    let (_dir, store, engine) = open_store();
    let g = Atom::DEFAULT_GRAPH;
    let xsd_int = "^^<http://www.w3.org/2001/XMLSchema#integer>";
    add(&store, g, "<http://e/a>", "<http://e/n>", &format!("\"2\"{xsd_int}"));
    add(&store, g, "<http://e/b>", "<http://e/n>", &format!("\"5\"{xsd_int}"));

    let got = rows(
        &engine,
        &store,
        "SELECT ?s ?double WHERE { ?s <http://e/n> ?n BIND(?n * 2 AS ?double) }",
    );
    assert_eq!(got.len(), 2);
    let doubles: Vec<&Value> = got.iter().map(|r| &r["double"]).collect();
    assert!(doubles.contains(&&Value::Integer(4)));
    assert!(doubles.contains(&&Value::Integer(10)));

    let got = rows(
        &engine,
        &store,
        "SELECT ?s WHERE { ?s <http://e/n> ?n VALUES (?n) { (2) } }",
    );
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["s"], Value::Iri("http://e/a".to_string()));
}

#[test]
fn test_subquery_join() {
    let (_dir, store, engine) = open_store();
    let g = Atom::DEFAULT_GRAPH;
    add(&store, g, "<http://e/a>", "<http://e/knows>", "<http://e/b>");
    add(&store, g, "<http://e/b>", "<http://e/knows>", "<http://e/c>");
    add(&store, g, "<http://e/b>", "<http://e/name>", "\"B\"");
    add(&store, g, "<http://e/c>", "<http://e/name>", "\"C\"");

    let got = rows(
        &engine,
        &store,
        "SELECT ?who ?name WHERE { ?who <http://e/name> ?name \
         { SELECT ?who WHERE { <http://e/a> <http://e/knows> ?who } } }",
    );
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["name"], Value::String("B".to_string()));
}

#[test]
fn test_modifiers() {
    let (_dir, store, engine) = open_store();
    let g = Atom::DEFAULT_GRAPH;
    let xsd_int = "^^<http://www.w3.org/2001/XMLSchema#integer>";
    for (s, n) in [("a", 3), ("b", 1), ("c", 2)] {
        add(
            &store,
            g,
            &format!("<http://e/{s}>"),
            "<http://e/n>",
            &format!("\"{n}\"{xsd_int}"),
        );
    }

    let got = rows(
        &engine,
        &store,
        "SELECT ?n WHERE { ?s <http://e/n> ?n } ORDER BY ?n",
    );
    let ns: Vec<&Value> = got.iter().map(|r| &r["n"]).collect();
    assert_eq!(ns, vec![&Value::Integer(1), &Value::Integer(2), &Value::Integer(3)]);

    let got = rows(
        &engine,
        &store,
        "SELECT ?n WHERE { ?s <http://e/n> ?n } ORDER BY DESC(?n) LIMIT 1",
    );
    assert_eq!(got[0]["n"], Value::Integer(3));

    let got = rows(
        &engine,
        &store,
        "SELECT ?n WHERE { ?s <http://e/n> ?n } ORDER BY ?n OFFSET 1 LIMIT 1",
    );
    assert_eq!(got[0]["n"], Value::Integer(2));

    // LIMIT 0 yields nothing (and must not seek).
    let got = rows(&engine, &store, "SELECT ?n WHERE { ?s <http://e/n> ?n } LIMIT 0");
    assert!(got.is_empty());
}

#[test]
fn test_distinct_and_aggregates() {
    let (_dir, store, engine) = open_store();
    let g = Atom::DEFAULT_GRAPH;
    let xsd_int = "^^<http://www.w3.org/2001/XMLSchema#integer>";
    add(&store, g, "<http://e/a>", "<http://e/v>", &format!("\"1\"{xsd_int}"));
    add(&store, g, "<http://e/a>", "<http://e/v>", &format!("\"2\"{xsd_int}"));
    add(&store, g, "<http://e/b>", "<http://e/v>", &format!("\"3\"{xsd_int}"));

    let got = rows(&engine, &store, "SELECT DISTINCT ?s WHERE { ?s <http://e/v> ?n }");
    assert_eq!(got.len(), 2);

    let got = rows(
        &engine,
        &store,
        "SELECT ?s (SUM(?n) AS ?total) WHERE { ?s <http://e/v> ?n } GROUP BY ?s \
         HAVING(SUM(?n) > 2) ORDER BY ?s",
    );
    assert_eq!(got.len(), 2);
    assert_eq!(got[0]["total"], Value::Integer(3));
    assert_eq!(got[1]["total"], Value::Integer(3));
}

#[test]
fn test_empty_pattern_yields_all() {
    let (_dir, store, engine) = open_store();
    let g = Atom::DEFAULT_GRAPH;
    for i in 0..5 {
        add(&store, g, &format!("<http://e/{i}>"), "<http://e/p>", "\"v\"");
    }
    let got = rows(&engine, &store, "SELECT * WHERE { ?s ?p ?o }");
    assert_eq!(got.len(), 5);
}

#[test]
fn test_update_insert_and_delete_data() {
    let (_dir, store, engine) = open_store();
    engine
        .update(
            &store,
            "INSERT DATA { <http://e/s> <http://e/p> \"v\" . \
             GRAPH <http://e/g> { <http://e/s> <http://e/p> \"w\" } }",
        )
        .unwrap();

    assert!(ask(&engine, &store, "ASK { <http://e/s> <http://e/p> \"v\" }"));
    assert!(ask(
        &engine,
        &store,
        "ASK { GRAPH <http://e/g> { <http://e/s> <http://e/p> \"w\" } }"
    ));

    engine
        .update(&store, "DELETE DATA { <http://e/s> <http://e/p> \"v\" }")
        .unwrap();
    assert!(!ask(&engine, &store, "ASK { <http://e/s> <http://e/p> \"v\" }"));
}

#[test]
fn test_update_modify_where() {
    let (_dir, store, engine) = open_store();
    engine
        .update(
            &store,
            "INSERT DATA { <http://e/a> <http://e/old> \"1\" . <http://e/b> <http://e/old> \"2\" }",
        )
        .unwrap();
    engine
        .update(
            &store,
            "DELETE { ?s <http://e/old> ?o } INSERT { ?s <http://e/new> ?o } \
             WHERE { ?s <http://e/old> ?o }",
        )
        .unwrap();

    assert!(!ask(&engine, &store, "ASK { ?s <http://e/old> ?o }"));
    let got = rows(&engine, &store, "SELECT ?s WHERE { ?s <http://e/new> ?o }");
    assert_eq!(got.len(), 2);
}

#[test]
fn test_update_clear_copy_move() {
    let (_dir, store, engine) = open_store();
    engine
        .update(
            &store,
            "INSERT DATA { GRAPH <http://e/g1> { <http://e/s> <http://e/p> \"x\" } }",
        )
        .unwrap();

    engine
        .update(&store, "COPY GRAPH <http://e/g1> TO GRAPH <http://e/g2>")
        .unwrap();
    assert!(ask(
        &engine,
        &store,
        "ASK { GRAPH <http://e/g2> { ?s ?p ?o } }"
    ));

    engine.update(&store, "CLEAR GRAPH <http://e/g1>").unwrap();
    assert!(!ask(
        &engine,
        &store,
        "ASK { GRAPH <http://e/g1> { ?s ?p ?o } }"
    ));

    engine
        .update(&store, "MOVE GRAPH <http://e/g2> TO GRAPH <http://e/g3>")
        .unwrap();
    assert!(ask(
        &engine,
        &store,
        "ASK { GRAPH <http://e/g3> { ?s ?p ?o } }"
    ));
    assert!(!ask(
        &engine,
        &store,
        "ASK { GRAPH <http://e/g2> { ?s ?p ?o } }"
    ));
}

#[test]
fn test_construct_and_describe() {
    let (_dir, store, engine) = open_store();
    let g = Atom::DEFAULT_GRAPH;
    add(&store, g, "<http://e/a>", "<http://e/name>", "\"A\"");
    add(&store, g, "<http://e/a>", "<http://e/mail>", "\"a@x\"");

    let QueryResult::Triples(triples) = engine
        .query(
            &store,
            "CONSTRUCT { ?s <http://e/label> ?n } WHERE { ?s <http://e/name> ?n }",
        )
        .unwrap()
    else {
        panic!("expected triples");
    };
    assert_eq!(triples.len(), 1);
    assert_eq!(
        triples[0],
        [
            "<http://e/a>".to_string(),
            "<http://e/label>".to_string(),
            "\"A\"".to_string()
        ]
    );

    let QueryResult::Triples(triples) = engine
        .query(&store, "DESCRIBE <http://e/a>")
        .unwrap()
    else {
        panic!("expected triples");
    };
    assert_eq!(triples.len(), 2);
}

#[test]
fn test_service_silent_swallows_failure() {
    let (_dir, store, engine) = open_store();
    let g = Atom::DEFAULT_GRAPH;
    add(&store, g, "<http://e/a>", "<http://e/p>", "\"v\"");

    // No service executor is configured: the non-silent form fails,
    // the SILENT form yields no rows and the query continues.
    let err = engine.query(
        &store,
        "SELECT * WHERE { SERVICE <http://remote/sparql> { ?s ?p ?o } }",
    );
    assert!(err.is_err());

    let got = rows(
        &engine,
        &store,
        "SELECT ?o WHERE { ?s ?p ?o SERVICE SILENT <http://remote/sparql> { ?x ?y ?z } }",
    );
    assert!(got.is_empty());
}

#[test]
fn test_self_join_repeated_variable() {
    let (_dir, store, engine) = open_store();
    let g = Atom::DEFAULT_GRAPH;
    add(&store, g, "<http://e/a>", "<http://e/p>", "<http://e/a>");
    add(&store, g, "<http://e/a>", "<http://e/p>", "<http://e/b>");

    let got = rows(&engine, &store, "SELECT ?x WHERE { ?x <http://e/p> ?x }");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["x"], Value::Iri("http://e/a".to_string()));
}

#[test]
fn test_plan_round_trips_through_printer() {
    let src = "SELECT DISTINCT ?f ?age WHERE { <ex:alice> <ex:knows> ?f . ?f <ex:age> ?age \
               FILTER(?age > 40) } ORDER BY DESC(?age) LIMIT 10";
    let plan = sparql::parse(src).unwrap();
    let printed = plan.to_string();
    let reparsed = sparql::parse(&printed).unwrap();
    assert_eq!(printed, reparsed.to_string());
}
