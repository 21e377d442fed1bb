use serde_json::json;
use shimmytwig::{render_template, ArrayLoader, Environment};

const FORMS: &str = r#"{% macro input(name, value = '', type = 'text') %}<input type="{{ type }}" name="{{ name }}" value="{{ value }}">{% endmacro %}"#;

fn env(templates: &[(&str, &str)]) -> Environment {
    Environment::new(ArrayLoader::new(templates.iter().copied()))
}

#[test]
fn self_macros_with_defaults() {
    let out = render_template(
        "{% macro hi(name = 'you') %}Hi {{ name }}{% endmacro %}{{ _self.hi() }}|{{ _self.hi('Bob') }}",
        json!({}),
    )
    .unwrap();
    assert_eq!(out, "Hi you|Hi Bob");
}

#[test]
fn imported_macros() {
    let env = env(&[("forms", FORMS), ("page", "{% import 'forms' as forms %}{{ forms.input('q') }}")]);
    assert_eq!(
        env.render("page", json!({})).unwrap(),
        r#"<input type="text" name="q" value="">"#
    );
}

#[test]
fn named_arguments() {
    let env = env(&[
        ("forms", FORMS),
        ("page", "{% import 'forms' as forms %}{{ forms.input('q', type = 'search') }}"),
    ]);
    assert_eq!(
        env.render("page", json!({})).unwrap(),
        r#"<input type="search" name="q" value="">"#
    );
}

#[test]
fn from_import_with_alias() {
    let env = env(&[
        ("forms", FORMS),
        ("page", "{% from 'forms' import input as field, input %}{{ field('a') }}{{ input('b', 1) }}"),
    ]);
    assert_eq!(
        env.render("page", json!({})).unwrap(),
        r#"<input type="text" name="a" value=""><input type="text" name="b" value="1">"#
    );
}

#[test]
fn import_aliases_are_not_variables() {
    let env = env(&[
        ("forms", FORMS),
        ("page", "{% import 'forms' as m %}{% set m = 'str' %}{{ m }}|{{ m.input('q') }}"),
    ]);
    assert_eq!(
        env.render("page", json!({})).unwrap(),
        r#"str|<input type="text" name="q" value="">"#
    );
}

#[test]
fn macros_do_not_see_the_caller_context() {
    let out = render_template(
        "{% set local = 2 %}{% macro show() %}[{{ secret }}{{ local }}]{% endmacro %}{{ _self.show() }}",
        json!({"secret": 1}),
    )
    .unwrap();
    assert_eq!(out, "[]");
}

#[test]
fn extra_arguments_land_in_varargs() {
    let out = render_template(
        "{% macro all(first) %}{{ first }}:{% for a in varargs %}{{ a }}{% endfor %}{% endmacro %}{{ _self.all(1, 2, 3) }}",
        json!({}),
    )
    .unwrap();
    assert_eq!(out, "1:23");
}

#[test]
fn macro_output_is_safe() {
    let out = render_template(
        "{% macro b() %}<b>{% endmacro %}{{ _self.b() }}{% set x = _self.b() %}{{ x }}",
        json!({}),
    )
    .unwrap();
    assert_eq!(out, "<b><b>");
}

#[test]
fn recursive_macros() {
    let out = render_template(
        "{% macro count(n) %}{{ n }}{% if n > 0 %}{{ _self.count(n - 1) }}{% endif %}{% endmacro %}{{ _self.count(3) }}",
        json!({}),
    )
    .unwrap();
    assert_eq!(out, "3210");
}

#[test]
fn macros_use_the_imports_of_their_own_template() {
    let env = env(&[
        ("forms", FORMS),
        ("lib", "{% import 'forms' as f %}{% macro row(n) %}<p>{{ f.input(n) }}</p>{% endmacro %}"),
        ("page", "{% import 'lib' as lib %}{{ lib.row('q') }}"),
    ]);
    assert_eq!(
        env.render("page", json!({})).unwrap(),
        r#"<p><input type="text" name="q" value=""></p>"#
    );
}

#[test]
fn imports_inside_blocks_are_local() {
    let env = env(&[
        ("forms", FORMS),
        ("page", "{% block b %}{% import 'forms' as f %}{{ f.input('x') }}{% endblock %}"),
    ]);
    assert_eq!(
        env.render("page", json!({})).unwrap(),
        r#"<input type="text" name="x" value="">"#
    );
}

#[test]
fn calling_errors() {
    let env = env(&[
        ("forms", FORMS),
        ("missing", "{% import 'forms' as f %}\n{{ f.nope() }}"),
        ("unknown", "{% import 'forms' as f %}{{ f.input('q', color = 'red') }}"),
    ]);

    let err = env.render("missing", json!({})).unwrap_err();
    assert_eq!(err.raw_message(), "Macro \"nope\" is not defined in template \"forms\".");
    assert_eq!(err.line(), Some(2));

    let err = env.render("unknown", json!({})).unwrap_err();
    assert_eq!(err.raw_message(), "Macro \"input\" has no argument named \"color\".");
}
