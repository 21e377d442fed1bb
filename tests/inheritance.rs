use serde_json::json;
use shimmytwig::{ArrayLoader, Environment, Error};

fn env(templates: &[(&str, &str)]) -> Environment {
    Environment::new(ArrayLoader::new(templates.iter().copied()))
}

#[test]
fn child_blocks_replace_parent_blocks() {
    let env = env(&[
        ("base", "<{% block a %}A{% endblock %}|{% block b %}B{% endblock %}>"),
        ("child", "{% extends 'base' %}{% block a %}X{% endblock %}"),
    ]);
    assert_eq!(env.render("child", json!({})).unwrap(), "<X|B>");
    assert_eq!(env.render("base", json!({})).unwrap(), "<A|B>");
}

#[test]
fn parent_calls_walk_up_three_levels() {
    let env = env(&[
        ("root", "{% block n %}1{% endblock %}"),
        ("middle", "{% extends 'root' %}{% block n %}2{{ parent() }}{% endblock %}"),
        ("leaf", "{% extends 'middle' %}{% block n %}3{{ parent() }}{% endblock %}"),
    ]);
    assert_eq!(env.render("leaf", json!({})).unwrap(), "321");
    assert_eq!(env.render("middle", json!({})).unwrap(), "21");
}

#[test]
fn nested_blocks_are_overridable() {
    let env = env(&[
        ("base", "{% block outer %}[{% block inner %}x{% endblock %}]{% endblock %}"),
        ("child", "{% extends 'base' %}{% block inner %}I{% endblock %}"),
    ]);
    assert_eq!(env.render("child", json!({})).unwrap(), "[I]");
}

#[test]
fn block_function_dispatches_through_the_child() {
    let env = env(&[
        ("base", "{% block a %}A{% endblock %}:{{ block('a') }}"),
        ("child", "{% extends 'base' %}{% block a %}C{% endblock %}"),
    ]);
    assert_eq!(env.render("child", json!({})).unwrap(), "C:C");
}

#[test]
fn block_function_can_target_another_template() {
    let env = env(&[
        ("parts", "{% block greeting %}hi {{ who }}{% endblock %}"),
        ("page", "{{ block('greeting', 'parts') }}"),
    ]);
    assert_eq!(env.render("page", json!({"who": "<x>"})).unwrap(), "hi &lt;x&gt;");
}

#[test]
fn blocks_see_the_template_context_but_do_not_leak_assignments() {
    let env = env(&[
        ("base", "{% block a %}{% set inner = 1 %}{{ title }}{% endblock %}[{{ inner }}]"),
        ("child", "{% extends 'base' %}{% set title = 'T' %}"),
    ]);
    assert_eq!(env.render("child", json!({})).unwrap(), "T[]");
}

#[test]
fn parent_can_be_an_expression() {
    let env = env(&[
        ("one", "1{% block b %}{% endblock %}"),
        ("two", "2{% block b %}{% endblock %}"),
        ("child", "{% extends layout %}{% block b %}c{% endblock %}"),
        ("computed", "{% set layout = 'tw' ~ 'o' %}{% extends layout %}{% block b %}d{% endblock %}"),
    ]);
    assert_eq!(env.render("child", json!({"layout": "one"})).unwrap(), "1c");
    assert_eq!(env.render("child", json!({"layout": "two"})).unwrap(), "2c");
    assert_eq!(env.render("computed", json!({})).unwrap(), "2d");
}

#[test]
fn parent_can_be_a_list_of_candidates() {
    let env = env(&[
        ("base", "<{% block b %}{% endblock %}>"),
        ("child", "{% extends ['missing', 'base'] %}{% block b %}c{% endblock %}"),
        ("lost", "{% extends ['missing', 'gone'] %}"),
    ]);
    assert_eq!(env.render("child", json!({})).unwrap(), "<c>");

    let err = env.render("lost", json!({})).unwrap_err();
    assert!(matches!(err, Error::Loader(_)));
    assert_eq!(
        err.raw_message(),
        "Unable to find one of the following templates: \"missing\", \"gone\"."
    );
}

#[test]
fn missing_parent_is_a_loader_error() {
    let env = env(&[("child", "{% extends 'nowhere' %}")]);
    let err = env.render("child", json!({})).unwrap_err();
    assert!(matches!(err, Error::Loader(_)));
}

#[test]
fn circular_inheritance_is_detected() {
    let env = env(&[("a", "{% extends 'b' %}"), ("b", "{% extends 'a' %}")]);
    let err = env.render("a", json!({})).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
    assert_eq!(err.raw_message(), "Circular inheritance detected: \"a\" -> \"b\" -> \"a\".");
}

#[test]
fn trait_blocks_win_over_parent_blocks() {
    let env = env(&[
        ("base", "<{% block title %}B{% endblock %}>"),
        ("t", "{% block title %}T{% endblock %}"),
        ("borrowed", "{% extends 'base' %}{% use 't' %}"),
        ("overridden", "{% extends 'base' %}{% use 't' %}{% block title %}P{{ parent() }}{% endblock %}"),
    ]);
    assert_eq!(env.render("borrowed", json!({})).unwrap(), "<T>");
    assert_eq!(env.render("overridden", json!({})).unwrap(), "<PT>");
}

#[test]
fn traits_without_a_parent_template() {
    let env = env(&[
        ("t", "{% block title %}ty{% endblock %}"),
        ("page", "{% use 't' %}{% block title %}p{{ parent() }}{% endblock %}x"),
    ]);
    assert_eq!(env.render("page", json!({})).unwrap(), "ptyx");
}

#[test]
fn renamed_trait_blocks() {
    let env = env(&[
        ("t", "{% block title %}tx{% endblock %}"),
        ("page", "{% use 't' with title as t_title %}{% block title %}[{{ block('t_title') }}]{% endblock %}"),
    ]);
    assert_eq!(env.render("page", json!({})).unwrap(), "[tx]");
}

#[test]
fn traits_can_use_other_traits() {
    let env = env(&[
        ("inner", "{% block a %}i{% endblock %}"),
        ("outer", "{% use 'inner' %}{% block b %}o{% endblock %}"),
        ("page", "{% use 'outer' %}{{ block('a') }}{{ block('b') }}"),
    ]);
    assert_eq!(env.render("page", json!({})).unwrap(), "io");
}

#[test]
fn render_block_uses_the_most_derived_definition() {
    let env = env(&[
        ("base", "{% block a %}A{% endblock %}{% block b %}B{{ v }}{% endblock %}"),
        ("child", "{% extends 'base' %}{% block a %}C{{ parent() }}{% endblock %}"),
    ]);
    let child = env.load("child").unwrap();
    assert!(child.has_block("a"));
    assert!(!child.has_block("b"));
    assert_eq!(child.render_block("a", json!({})).unwrap(), "CA");
    assert_eq!(child.render_block("b", json!({"v": 1})).unwrap(), "B1");

    let err = child.render_block("nope", json!({})).unwrap_err();
    assert_eq!(err.raw_message(), "Block \"nope\" on template \"child\" does not exist.");
}

#[test]
fn embed_overrides_blocks_of_the_embedded_template() {
    let env = env(&[
        ("card", "<{% block body %}default{% endblock %}>"),
        (
            "page",
            "A{% embed 'card' %}{% block body %}E{{ n }}{% endblock %}{% endembed %}{% embed 'card' %}{% endembed %}Z",
        ),
    ]);
    assert_eq!(env.render("page", json!({"n": 1})).unwrap(), "A<E1><default>Z");
}

#[test]
fn embed_with_variables_only_and_missing() {
    let env = env(&[
        ("card", "<{% block body %}{% endblock %}>"),
        (
            "page",
            "{% embed 'card' with {m: 2} only %}{% block body %}{{ n }}{{ m }}{% endblock %}{% endembed %}{% embed 'nope' ignore missing %}{% block body %}x{% endblock %}{% endembed %}",
        ),
    ]);
    assert_eq!(env.render("page", json!({"n": 1})).unwrap(), "<2>");
}
