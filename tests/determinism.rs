use proptest::prelude::*;
use serde_json::json;
use shimmytwig::{ArrayLoader, Config, Environment, Source};

fn fresh(config: Config) -> Environment {
    Environment::new(ArrayLoader::default()).with_config(config)
}

fn fragment() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z ]{0,8}",
        "[a-z]{1,5}".prop_map(|name| format!("{{{{ {name} }}}}")),
        "[a-z]{1,5}".prop_map(|name| format!("{{{{ {name}|upper }}}}")),
        (0i64..100, 0i64..100).prop_map(|(a, b)| format!("{{{{ {a} + {b} * 2 }}}}")),
        "[a-z]{1,5}".prop_map(|name| format!("{{% block {name} %}}x{{% endblock %}}")),
        Just("{% for i in 1..3 %}{{ loop.index }}{% endfor %}".to_string()),
        Just("{% if a %}y{% else %}n{% endif %}".to_string()),
        Just("{% macro m(a = 1) %}{{ a }}{% endmacro %}".to_string()),
        Just("{# note #}".to_string()),
        Just("\n".to_string()),
    ]
}

proptest! {
    #[test]
    fn compilation_is_deterministic(parts in prop::collection::vec(fragment(), 0..12), debug in any::<bool>()) {
        let code = parts.concat();
        let source = Source::new(code.as_str(), "gen.html", "");
        let first = fresh(Config::default().with_debug(debug)).compile_source(&source);
        let second = fresh(Config::default().with_debug(debug)).compile_source(&source);
        match (first, second) {
            (Ok(a), Ok(b)) => prop_assert_eq!(a.artifact().unwrap(), b.artifact().unwrap()),
            (Err(a), Err(b)) => prop_assert_eq!(a, b),
            _ => prop_assert!(false, "compilation outcome differs for {:?}", code),
        }
    }

    #[test]
    fn lexing_never_panics(code in "(\\PC|\\{|\\}|%|#|-|~){0,64}") {
        let env = fresh(Config::default());
        let source = Source::new(code.as_str(), "any.html", "");
        if let Ok(stream) = env.tokenize(&source) {
            let _ = env.parse(stream);
        }
    }

    #[test]
    fn text_without_delimiters_renders_verbatim(text in "[a-zA-Z0-9 .,!?]{0,40}") {
        let env = fresh(Config::default());
        let out = env.create_template(&text, Some("plain.html")).unwrap().render(json!({})).unwrap();
        prop_assert_eq!(out, text);
    }
}

#[test]
fn rendering_twice_gives_the_same_output() {
    let env = Environment::new(ArrayLoader::new([
        ("base", "{% block a %}{% for k, v in m %}{{ k }}{{ v }}{% endfor %}{% endblock %}"),
        ("child", "{% extends 'base' %}{% block a %}[{{ parent() }}]{% endblock %}"),
    ]));
    let ctx = json!({"m": {"z": 1, "a": 2, "m": 3}});
    let first = env.render("child", &ctx).unwrap();
    env.clear_cache();
    let second = env.render("child", &ctx).unwrap();
    assert_eq!(first, "[z1a2m3]");
    assert_eq!(first, second);
}

#[test]
fn one_template_renders_on_many_threads() {
    let env = Environment::new(ArrayLoader::new([
        ("forms", "{% macro tag(v) %}<{{ v }}>{% endmacro %}"),
        ("base", "[{% block a %}{% endblock %}]"),
        (
            "page",
            "{% extends 'base' %}{% import 'forms' as f %}{% block a %}{% set mine = name %}{% for i in items %}{{ f.tag(mine ~ i) }}{% endfor %}{% endblock %}",
        ),
    ]));
    let template = env.load("page").unwrap();

    let outputs: Vec<Vec<String>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let template = template.clone();
                scope.spawn(move || {
                    (0..25)
                        .map(|_| template.render(json!({"name": format!("t{t}"), "items": [t, t + 1]})).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    for (t, runs) in outputs.iter().enumerate() {
        let expected = format!("[<t{t}{t}><t{t}{}>]", t + 1);
        assert_eq!(runs.len(), 25);
        assert!(runs.iter().all(|out| *out == expected), "thread {t}: {runs:?}");
    }
}
