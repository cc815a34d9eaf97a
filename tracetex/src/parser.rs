// Parser for trace scripts (`.tts` files).
//
// Parses a token stream (from the lexer) into an AST. Uses chumsky
// combinators. Grammar:
//
//   file     := NL* (fn_def (NL+ fn_def)*)? NL*
//   fn_def   := 'fn' IDENT '(' (param (',' param)*)? ')' '{' NL* stmts NL* '}'
//   param    := IDENT (':' dims)?
//   stmt     := 'let' IDENT '=' expr | 'return' expr (',' expr)*
//   expr     := cmp ('as' IDENT ('(' IDENT (',' IDENT)* ')')?)?
//   cmp      := sum (('<' | '<=' | '>' | '>=' | '==' | '!=') sum)?
//   sum      := product (('+' | '-') product)*
//   product  := unary (('*' | '/' | '@') unary)*
//   unary    := '-' unary | power
//   power    := atom ('^' unary)?
//   atom     := NUMBER | dims | IDENT ('(' args ')')? | '(' expr ')'
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics; parsing continues.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub file: Option<SourceFile>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a trace script. Lexes then parses.
///
/// Returns an AST (if parsing succeeded) plus any errors.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    // Convert lexer output to chumsky stream.
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = file_parser(source);
    let (file, parse_errors) = parser.parse(stream).into_output_errors();

    // Merge lex errors + parse errors.
    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        file,
        errors: all_errors,
    }
}

// ── Main parser builder ──
//
// All grammar rules are built inside `file_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn file_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, SourceFile, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Newlines ──

    let nl = just(Token::Newline).repeated().ignored();

    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    // ── Dims: '[' INT (',' INT)* ']' ──

    let dims = select! { Token::Int(n) => n }
        .separated_by(just(Token::Comma))
        .allow_trailing()
        .collect::<Vec<usize>>()
        .delimited_by(just(Token::LBracket), just(Token::RBracket));

    // ── Expressions ──

    let expr = recursive(|expr| {
        let number = select! {
            Token::Int(n) => ExprKind::Number(n as f64),
            Token::Float(v) => ExprKind::Number(v),
        };

        let args = expr
            .clone()
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LParen), just(Token::RParen));

        let var_or_call = ident
            .clone()
            .then(args.or_not())
            .map(|(name, args)| match args {
                Some(args) => ExprKind::Call(name, args),
                None => ExprKind::Var(name),
            });

        let atom = choice((number, dims.clone().map(ExprKind::Dims), var_or_call))
            .map_with(|kind, e| Expr::new(kind, e.span()))
            .or(expr
                .clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)))
            .boxed();

        // Exponentiation is right-associative and binds tighter than
        // negation: `-x ^ 2` is `-(x ^ 2)`, `x ^ -1` is allowed.
        let unary = recursive(|unary| {
            let power = atom
                .clone()
                .then(just(Token::Caret).ignore_then(unary.clone()).or_not())
                .map_with(|(base, exponent), e| match exponent {
                    Some(exponent) => Expr::binary(BinOp::Pow, base, exponent, e.span()),
                    None => base,
                });
            just(Token::Minus)
                .ignore_then(unary)
                .map_with(|operand, e| Expr::new(ExprKind::Neg(Box::new(operand)), e.span()))
                .or(power)
        })
        .boxed();

        let product_op = select! {
            Token::Star => BinOp::Mul,
            Token::Slash => BinOp::Div,
            Token::At => BinOp::MatMul,
        };
        let product = unary
            .clone()
            .foldl_with(product_op.then(unary).repeated(), |lhs, (op, rhs), e| {
                Expr::binary(op, lhs, rhs, e.span())
            })
            .boxed();

        let sum_op = select! {
            Token::Plus => BinOp::Add,
            Token::Minus => BinOp::Sub,
        };
        let sum = product
            .clone()
            .foldl_with(sum_op.then(product).repeated(), |lhs, (op, rhs), e| {
                Expr::binary(op, lhs, rhs, e.span())
            })
            .boxed();

        // Comparisons do not chain.
        let cmp_op = select! {
            Token::Lt => BinOp::Lt,
            Token::Le => BinOp::Le,
            Token::Gt => BinOp::Gt,
            Token::Ge => BinOp::Ge,
            Token::EqEq => BinOp::Eq,
            Token::Ne => BinOp::Ne,
        };
        let comparison = sum
            .clone()
            .then(cmp_op.then(sum).or_not())
            .map_with(|(lhs, rest), e| match rest {
                Some((op, rhs)) => Expr::binary(op, lhs, rhs, e.span()),
                None => lhs,
            });

        let depends_on = ident
            .clone()
            .separated_by(just(Token::Comma))
            .at_least(1)
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LParen), just(Token::RParen));

        comparison
            .then(
                just(Token::As)
                    .ignore_then(ident.clone())
                    .then(depends_on.or_not())
                    .or_not(),
            )
            .map_with(|(value, named), e| match named {
                Some((name, depends_on)) => Expr::new(
                    ExprKind::Named {
                        value: Box::new(value),
                        name,
                        depends_on,
                    },
                    e.span(),
                ),
                None => value,
            })
    });

    // ── Statements ──

    let let_stmt = just(Token::Let)
        .ignore_then(ident.clone())
        .then_ignore(just(Token::Equals))
        .then(expr.clone())
        .map(|(name, value)| StmtKind::Let { name, value });

    let return_stmt = just(Token::Return)
        .ignore_then(
            expr.clone()
                .separated_by(just(Token::Comma))
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .map(StmtKind::Return);

    let stmt = let_stmt.or(return_stmt).map_with(|kind, e| Stmt {
        kind,
        span: e.span(),
    });

    let body = nl
        .clone()
        .ignore_then(
            stmt.separated_by(just(Token::Newline).repeated().at_least(1))
                .allow_trailing()
                .collect::<Vec<_>>(),
        )
        .then_ignore(nl.clone())
        .delimited_by(just(Token::LBrace), just(Token::RBrace));

    // ── Function definition ──

    let param = ident
        .clone()
        .then(just(Token::Colon).ignore_then(dims).or_not())
        .map_with(|(name, shape), e| Param {
            name,
            shape: shape.unwrap_or_default(),
            span: e.span(),
        });

    let fn_def = just(Token::Fn)
        .ignore_then(ident.clone())
        .then(
            param
                .separated_by(just(Token::Comma))
                .allow_trailing()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then(body)
        .map_with(|((name, params), body), e| FnDef {
            name,
            params,
            body,
            span: e.span(),
        });

    // ── File ──

    nl.clone()
        .ignore_then(
            fn_def
                .separated_by(just(Token::Newline).repeated().at_least(1))
                .allow_trailing()
                .collect::<Vec<_>>(),
        )
        .then_ignore(nl)
        .map_with(move |functions, e| SourceFile {
            functions,
            span: e.span(),
        })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> SourceFile {
        let result = parse(source);
        assert!(
            result.errors.is_empty(),
            "unexpected errors: {:#?}",
            result.errors
        );
        result.file.expect("expected file")
    }

    fn parse_all(source: &str) -> (Option<SourceFile>, Vec<Rich<'static, Token, SimpleSpan>>) {
        let result = parse(source);
        (result.file, result.errors)
    }

    /// Parse `fn f() { return <expr> }` and return the expression.
    fn parse_expr(expr: &str) -> Expr {
        let file = parse_ok(&format!("fn f() {{ return {expr} }}"));
        let StmtKind::Return(mut values) = file.functions[0].body[0].kind.clone() else {
            panic!("expected Return")
        };
        values.remove(0)
    }

    /// Compact prefix form of an expression for structural assertions.
    fn sexpr(e: &Expr) -> String {
        match &e.kind {
            ExprKind::Number(v) => format!("{v}"),
            ExprKind::Dims(d) => format!("{d:?}"),
            ExprKind::Var(id) => id.name.clone(),
            ExprKind::Neg(x) => format!("(neg {})", sexpr(x)),
            ExprKind::Binary(op, a, b) => format!("({op:?} {} {})", sexpr(a), sexpr(b)),
            ExprKind::Call(f, args) => {
                let args: Vec<String> = args.iter().map(sexpr).collect();
                format!("({} {})", f.name, args.join(" "))
            }
            ExprKind::Named {
                value,
                name,
                depends_on,
            } => {
                let deps = depends_on
                    .as_ref()
                    .map(|ds| ds.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(","))
                    .unwrap_or_default();
                format!("(as {} {}[{}])", sexpr(value), name.name, deps)
            }
        }
    }

    // ── Empty / blank ──

    #[test]
    fn empty_file() {
        assert!(parse_ok("").functions.is_empty());
    }

    #[test]
    fn blank_lines_and_comments_only() {
        assert!(parse_ok("\n# nothing here\n\n").functions.is_empty());
    }

    // ── Function definitions ──

    #[test]
    fn function_with_shaped_params() {
        let file = parse_ok("fn f(x: [3], U: [3, 4], s) {\n  return x @ U\n}\n");
        let f = &file.functions[0];
        assert_eq!(f.name.name, "f");
        let params: Vec<(&str, &[usize])> = f
            .params
            .iter()
            .map(|p| (p.name.name.as_str(), p.shape.as_slice()))
            .collect();
        assert_eq!(params, vec![("x", &[3][..]), ("U", &[3, 4][..]), ("s", &[][..])]);
        assert_eq!(f.body.len(), 1);
    }

    #[test]
    fn multiple_functions_and_statements() {
        let file = parse_ok(
            "fn g(x) { return x * 2 }\n\nfn f(x, y) {\n  let z = x + y\n\n  return g(z), z\n}",
        );
        assert_eq!(file.functions.len(), 2);
        let body = &file.functions[1].body;
        assert!(matches!(&body[0].kind, StmtKind::Let { name, .. } if name.name == "z"));
        assert!(matches!(&body[1].kind, StmtKind::Return(v) if v.len() == 2));
    }

    #[test]
    fn spans_cover_source() {
        let file = parse_ok("fn f(x) { return x }");
        assert_eq!(file.functions[0].span.start, 0);
        assert_eq!(file.functions[0].span.end, 20);
        assert_eq!(file.functions[0].name.span.start, 3);
    }

    // ── Precedence ──

    #[test]
    fn product_binds_tighter_than_sum() {
        assert_eq!(sexpr(&parse_expr("x + y * z")), "(Add x (Mul y z))");
    }

    #[test]
    fn operators_are_left_associative() {
        assert_eq!(sexpr(&parse_expr("x - y - z")), "(Sub (Sub x y) z)");
        assert_eq!(sexpr(&parse_expr("x / y @ z")), "(MatMul (Div x y) z)");
    }

    #[test]
    fn power_is_right_associative_and_above_negation() {
        assert_eq!(sexpr(&parse_expr("x ^ 2 ^ 3")), "(Pow x (Pow 2 3))");
        assert_eq!(sexpr(&parse_expr("-x ^ 2")), "(neg (Pow x 2))");
        assert_eq!(sexpr(&parse_expr("x ^ -1")), "(Pow x (neg 1))");
    }

    #[test]
    fn comparison_is_loosest_operator() {
        assert_eq!(sexpr(&parse_expr("x + 1 >= y")), "(Ge (Add x 1) y)");
    }

    #[test]
    fn parentheses_group() {
        assert_eq!(sexpr(&parse_expr("(x + y) * z")), "(Mul (Add x y) z)");
    }

    // ── Calls and names ──

    #[test]
    fn calls_with_dims_argument() {
        assert_eq!(
            sexpr(&parse_expr("reshape(sum(x, 0), [1, 3])")),
            "(reshape (sum x 0) [1, 3])"
        );
    }

    #[test]
    fn named_with_dependencies() {
        assert_eq!(sexpr(&parse_expr("x + y as z(x, y)")), "(as (Add x y) z[x,y])");
        assert_eq!(sexpr(&parse_expr("(x as u) * 2")), "(Mul (as x u[]) 2)");
    }

    // ── Errors ──

    #[test]
    fn missing_brace_is_error() {
        let (_, errors) = parse_all("fn f(x) { return x");
        assert!(!errors.is_empty());
    }

    #[test]
    fn negative_shape_is_error() {
        let (_, errors) = parse_all("fn f(x: [-3]) { return x }");
        assert!(!errors.is_empty());
    }

    #[test]
    fn lex_error_is_reported() {
        let (_, errors) = parse_all("fn f(x) { return x $ 2 }");
        assert!(!errors.is_empty());
    }
}
