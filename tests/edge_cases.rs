use serde_json::json;
use shimmytwig::{render_template, ArrayLoader, Config, Environment, Error, SecurityPolicy};

fn env(templates: &[(&str, &str)]) -> Environment {
    Environment::new(ArrayLoader::new(templates.iter().copied()))
}

fn render(code: &str, ctx: serde_json::Value) -> String {
    render_template(code, ctx).unwrap()
}

// ── Output basics ──

#[test]
fn empty_template_produces_empty_output() {
    assert_eq!(render("", json!({})), "");
}

#[test]
fn plain_text_template_no_tags() {
    assert_eq!(render("Hello, world!\n", json!({})), "Hello, world!\n");
}

#[test]
fn comments_produce_nothing() {
    assert_eq!(render("a{# note #}b", json!({})), "ab");
}

#[test]
fn dot_access_and_bracket_access_equivalent() {
    let ctx = json!({"user": {"name": "ada"}});
    assert_eq!(render("{{ user.name }}", ctx.clone()), "ada");
    assert_eq!(render("{{ user['name'] }}", ctx), "ada");
}

#[test]
fn missing_values_print_nothing_by_default() {
    assert_eq!(render("[{{ nope }}][{{ user.name }}]", json!({"user": {}})), "[][]");
}

// ── Whitespace ──

#[test]
fn dash_modifiers_trim_all_whitespace() {
    assert_eq!(render("a  \n {{- 'b' -}} \n c", json!({})), "abc");
}

#[test]
fn tilde_modifiers_keep_newlines() {
    assert_eq!(render("a  {{~ 'b' ~}}  \nc", json!({})), "ab\nc");
}

#[test]
fn verbatim_is_left_alone() {
    assert_eq!(render("{% verbatim %}{{ x }}{% endverbatim %}", json!({"x": 1})), "{{ x }}");
}

#[test]
fn windows_newlines_are_normalized() {
    assert_eq!(render("a\r\nb", json!({})), "a\nb");
}

// ── Expressions ──

#[test]
fn operator_precedence() {
    assert_eq!(render("{{ 1 + 2 * 3 }}", json!({})), "7");
    assert_eq!(render("{{ (1 + 2) * 3 }}", json!({})), "9");
    assert_eq!(render("{{ 2 ** 3 ** 2 }}", json!({})), "512");
    assert_eq!(render("{{ 7 // 2 }}|{{ 7 % 3 }}|{{ -2 + 5 }}", json!({})), "3|1|3");
    assert_eq!(render("{{ 'a' ~ (1 + 2) }}", json!({})), "a3");
}

#[test]
fn conditional_forms() {
    assert_eq!(render("{{ 1 < 2 ? 'y' : 'n' }}", json!({})), "y");
    assert_eq!(render("{{ name ?: 'anon' }}", json!({"name": ""})), "anon");
    assert_eq!(render("[{{ false ? 'y' }}]", json!({})), "[]");
}

#[test]
fn null_coalescing() {
    assert_eq!(render("{{ missing ?? 'd' }}", json!({})), "d");
    assert_eq!(render("{{ a.b.c ?? 'd' }}", json!({"a": {}})), "d");
    assert_eq!(render("{{ v ?? 'd' }}", json!({"v": 0})), "0");
}

#[test]
fn tests_and_negated_tests() {
    assert_eq!(render("{{ 4 is even ? 'e' : 'o' }}", json!({})), "e");
    assert_eq!(render("{{ 3 is not even ? 'odd' }}", json!({})), "odd");
    assert_eq!(render("{% if 9 is divisible by(3) %}y{% endif %}", json!({})), "y");
    assert_eq!(render("{{ x is defined ? 'd' : 'u' }}", json!({})), "u");
}

#[test]
fn containment_and_string_operators() {
    assert_eq!(render("{{ 'a' in ['a', 'b'] ? 1 : 0 }}", json!({})), "1");
    assert_eq!(render("{{ 'z' not in 'abc' ? 1 : 0 }}", json!({})), "1");
    assert_eq!(render("{{ 'abc' matches '/^A/i' ? 'm' }}", json!({})), "m");
    assert_eq!(render("{{ 'abc' starts with 'ab' ? 's' }}{{ 'abc' ends with 'bc' ? 'e' }}", json!({})), "se");
}

#[test]
fn ranges_and_slices() {
    assert_eq!(render("{{ (1..4)|join(',') }}", json!({})), "1,2,3,4");
    assert_eq!(render("{{ ('a'..'c')|join }}", json!({})), "abc");
    assert_eq!(render("{{ [1, 2, 3, 4][1:2]|join(',') }}", json!({})), "2,3");
}

#[test]
fn string_interpolation() {
    assert_eq!(render("{{ \"Hello #{name|upper}!\" }}", json!({"name": "bob"})), "Hello BOB!");
}

#[test]
fn hash_literals_and_shorthand() {
    let out = render("{% set a = 1 %}{% for k, v in {a, 'b': 2} %}{{ k }}={{ v }};{% endfor %}", json!({}));
    assert_eq!(out, "a=1;b=2;");
}

// ── Control flow ──

#[test]
fn loop_first_and_last_single_item() {
    let out = render(
        "{% for i in items %}{% if loop.first %}F{% endif %}{% if loop.last %}L{% endif %}{% endfor %}",
        json!({"items": [1]}),
    );
    assert_eq!(out, "FL");
}

#[test]
fn loop_counters() {
    let out = render(
        "{% for i in items %}{{ loop.index }}/{{ loop.revindex0 }}/{{ loop.length }} {% endfor %}",
        json!({"items": ["a", "b"]}),
    );
    assert_eq!(out, "1/1/2 2/0/2 ");
}

#[test]
fn for_else_runs_on_empty_sequences() {
    assert_eq!(render("{% for i in items %}x{% else %}none{% endfor %}", json!({"items": []})), "none");
    assert_eq!(render("{% for i in missing %}x{% else %}none{% endfor %}", json!({})), "none");
}

#[test]
fn key_value_loop_keeps_mapping_order() {
    let out = render("{% for k, v in m %}{{ k }}={{ v }};{% endfor %}", json!({"m": {"b": 1, "a": 2}}));
    assert_eq!(out, "b=1;a=2;");
}

#[test]
fn set_inside_loop_updates_outer_variable() {
    let out = render("{% set n = 0 %}{% for i in 1..3 %}{% set n = n + i %}{% endfor %}{{ n }}", json!({}));
    assert_eq!(out, "6");
}

#[test]
fn loop_local_variables_do_not_leak() {
    let out = render("{% for i in [1] %}{% set inner = 'x' %}{% endfor %}[{{ inner }}][{{ i }}]", json!({}));
    assert_eq!(out, "[][]");
}

#[test]
fn if_elseif_else_chain() {
    let code = "{% if n > 2 %}big{% elseif n > 0 %}small{% else %}none{% endif %}";
    assert_eq!(render(code, json!({"n": 5})), "big");
    assert_eq!(render(code, json!({"n": 1})), "small");
    assert_eq!(render(code, json!({"n": 0})), "none");
}

#[test]
fn multiple_assignment_and_capture() {
    assert_eq!(render("{% set a, b = 1, 2 %}{{ b }}{{ a }}", json!({})), "21");
    assert_eq!(render("{% set s %}<i>{{ x }}</i>{% endset %}{{ s }}", json!({"x": "&"})), "<i>&amp;</i>");
}

#[test]
fn with_scopes_variables() {
    let ctx = json!({"y": 2});
    assert_eq!(render("{% with {x: 1} %}{{ x }}{{ y }}{% endwith %}{{ x }}", ctx.clone()), "12");
    assert_eq!(render("{% with {x: 1} only %}{{ x }}{{ y }}{% endwith %}", ctx), "1");
}

#[test]
fn apply_filters_a_section() {
    assert_eq!(render("{% apply upper %}hi {{ name }}{% endapply %}", json!({"name": "bob"})), "HI BOB");
}

#[test]
fn do_discards_its_value() {
    assert_eq!(render("{% do 1 + 1 %}ok", json!({})), "ok");
}

// ── Escaping ──

#[test]
fn html_autoescape_by_default() {
    let ctx = json!({"s": "<b>"});
    assert_eq!(render("{{ s }}", ctx.clone()), "&lt;b&gt;");
    assert_eq!(render("{{ s|raw }}", ctx.clone()), "<b>");
    assert_eq!(render("{{ '<b>' }}", ctx.clone()), "<b>");
    assert_eq!(render("{{ s|raw ~ '' }}", ctx), "&lt;b&gt;");
}

#[test]
fn autoescape_tag_switches_strategy() {
    let ctx = json!({"s": "<b>"});
    assert_eq!(render("{% autoescape false %}{{ s }}{% endautoescape %}", ctx.clone()), "<b>");
    assert_eq!(render("{% autoescape 'url' %}{{ q }}{% endautoescape %}", json!({"q": "a b"})), "a%20b");
    assert_eq!(render("{{ s|e }}{{ s|escape }}", ctx), "&lt;b&gt;&lt;b&gt;");
}

#[test]
fn autoescape_can_be_disabled_in_config() {
    let env = env(&[("t", "{{ s }}")]).with_config(Config::default().with_autoescape(None));
    assert_eq!(env.render("t", json!({"s": "<b>"})).unwrap(), "<b>");
}

// ── Includes ──

#[test]
fn include_with_variables_and_only() {
    let env = env(&[
        ("inc", "{{ a }}-{{ b }}"),
        ("main", "{% include 'inc' with {b: 2} %}|{% include 'inc' with {b: 3} only %}"),
    ]);
    assert_eq!(env.render("main", json!({"a": 1})).unwrap(), "1-2|-3");
}

#[test]
fn include_ignore_missing_and_candidates() {
    let env = env(&[
        ("inc", "inc"),
        ("main", "{% include 'missing' ignore missing %}|{% include ['nope', 'inc'] %}"),
    ]);
    assert_eq!(env.render("main", json!({})).unwrap(), "|inc");
}

#[test]
fn include_function_returns_markup() {
    let env = env(&[("inc", "<{{ b }}>"), ("main", "{{ include('inc', {b: 5}) }}")]);
    assert_eq!(env.render("main", json!({})).unwrap(), "<5>");
}

#[test]
fn recursive_includes_are_allowed() {
    let env = env(&[("tree", "{{ n }}{% if n > 0 %}{% include 'tree' with {n: n - 1} %}{% endif %}")]);
    assert_eq!(env.render("tree", json!({"n": 2})).unwrap(), "210");
}

#[test]
fn template_from_string_can_be_included() {
    let out = render("{{ include(template_from_string('Hi {{ who }}')) }}", json!({"who": "x"}));
    assert_eq!(out, "Hi x");
}

// ── Sandbox ──

#[test]
fn sandboxed_includes_follow_the_policy() {
    let templates = [
        ("loop", "{% for i in [1] %}{{ i|abs }}{% endfor %}"),
        ("main", "{% sandbox %}{% include 'loop' %}{% endsandbox %}"),
        ("open", "{% include 'loop' %}"),
    ];

    let strict = env(&templates);
    let err = strict.render("main", json!({})).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
    assert_eq!(err.message(), "Tag \"for\" is not allowed in \"loop\".");
    assert_eq!(strict.render("open", json!({})).unwrap(), "1");

    let policy = SecurityPolicy::default().allow_tags(["for"]);
    let filters = env(&templates).with_config(Config::default().with_security_policy(policy.clone()));
    assert_eq!(
        filters.render("main", json!({})).unwrap_err().raw_message(),
        "Filter \"abs\" is not allowed."
    );

    let allowed = env(&templates).with_config(Config::default().with_security_policy(policy.allow_filters(["abs"])));
    assert_eq!(allowed.render("main", json!({})).unwrap(), "1");
}

// ── Configuration ──

#[test]
fn configuration_from_json() {
    let config = Config::from_json(r#"{"strict_variables": true}"#).unwrap();
    let env = env(&[("t", "{{ x }}")]).with_config(config);
    let err = env.render("t", json!({})).unwrap_err();
    assert_eq!(err.message(), "Variable \"x\" does not exist in \"t\" at line 1.");
}
