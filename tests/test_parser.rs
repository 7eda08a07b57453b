use pretty_assertions::assert_eq;
use ripple::{ErrorKind, Lexer, ParserOptions, Runtime, SourceFile};

fn tree(text: &str) -> String {
    let rt = Runtime::new().unwrap();
    rt.parse("test", text, &ParserOptions::default())
        .unwrap()
        .to_string()
}

fn parse_error(text: &str, options: &ParserOptions) -> ErrorKind {
    let rt = Runtime::new().unwrap();
    rt.parse("test", text, options).unwrap_err().kind()
}

#[test]
fn tokens_render_one_per_line() {
    let source = SourceFile::new("test", "x := 1.5 + \"hi\" // done");
    let rendered: Vec<String> = Lexer::new(&source)
        .map(|token| token.unwrap().to_string())
        .collect();
    assert_eq!(
        rendered,
        vec![
            "IDENTIFIER x null",
            "OPERATOR := null",
            "DECIMAL 1.5 1.5",
            "OPERATOR + null",
            "STRING \"hi\" hi",
        ]
    );
}

#[test]
fn operators_bind_by_precedence() {
    assert_eq!(tree("a || b && c"), "(|| a (&& b c))");
    assert_eq!(tree("a == b + c * d"), "(== a (+ b (* c d)))");
    assert_eq!(tree("!a.b"), "(! (. b a))");
    assert_eq!(tree("x | f | g"), "(| (| x f) g)");
}

#[test]
fn reactive_operators_bind_loosely() {
    assert_eq!(tree("x > 1 ? y"), "(? (> x 1) y)");
    assert_eq!(tree("a + 1 => b"), "(=> (+ a 1) b)");
}

#[test]
fn collections_and_ranges() {
    assert_eq!(tree("[1, 2]"), "(list 1 2)");
    assert_eq!(tree("[1..3)"), "(range 1 3)");
    assert_eq!(tree("a[0]"), "(subscript a 0)");
    assert_eq!(tree("list each $1 * 2"), "(each list (* $1 2))");
}

#[test]
fn declarations_show_their_name() {
    assert_eq!(tree("x = 1 + 2"), "(= x (+ 1 2))");
    assert_eq!(tree("y := x"), "(:= y x)");
}

#[test]
fn unbalanced_input_is_a_parse_error() {
    assert_eq!(parse_error("(1 + 2", &ParserOptions::default()), ErrorKind::Parse);
    assert_eq!(parse_error("[1, 2", &ParserOptions::default()), ErrorKind::Parse);
    assert_eq!(parse_error("x = ", &ParserOptions::default()), ErrorKind::Parse);
}

#[test]
fn pure_mode_rejects_impure_constructs() {
    let pure = ParserOptions::pure();
    assert_eq!(parse_error("x => y", &pure), ErrorKind::PurityViolation);
    assert_eq!(parse_error("every 1 sec x", &pure), ErrorKind::PurityViolation);
    assert_eq!(parse_error("input()", &pure), ErrorKind::PurityViolation);
    let rt = Runtime::new().unwrap();
    assert!(rt.parse("test", "a = max(1, 2) * 3", &pure).is_ok());
}

#[test]
fn parsing_is_lazy() {
    let rt = Runtime::new().unwrap();
    let script = rt
        .parse("test", "x = missing + 1", &ParserOptions::default())
        .unwrap();
    assert_eq!(script.children().len(), 1);
    assert!(!rt.root().has("x"));
}
