//! End-to-end scenarios and quantified invariants run through the
//! public `Vm` API against literal Lua source, rather than unit-level
//! checks on internal types.

use lua54rt::value::LuaValue;
use lua54rt::Vm;

fn run(src: &str) -> Vec<LuaValue> {
    let mut vm = Vm::new();
    vm.exec(src.as_bytes(), "scenario").unwrap_or_else(|e| panic!("{src}\n{e}"))
}

fn run_bool(src: &str) -> bool {
    matches!(run(src).as_slice(), [LuaValue::Boolean(true)])
}

// S1 — integer `for` with a negative bound stays integer-typed throughout.
#[test]
fn s1_integer_for_with_negative_bound() {
    assert!(run_bool(
        r#"
        for j = -3, 3 do
          if math.type(j) ~= "integer" then return false end
        end
        return true
        "#
    ));
}

// S2 — varargs forward through nested one-less-argument calls.
#[test]
fn s2_nested_vararg_forwarding() {
    let results = run(
        r#"
        local function oneless(a, ...) return ... end
        return oneless(oneless(oneless(1,2,3,4)))
        "#,
    );
    assert!(matches!(results.as_slice(), [LuaValue::Integer(4)]));
}

// S4 — a <const> reassignment is a compile-time error `load` reports as (nil, message).
#[test]
fn s4_const_violation_is_reported_by_load() {
    assert!(run_bool(
        r#"
        local ok, err = load("local x <const> = 1; x = 2")
        return ok == nil and err:find("attempt to assign to const variable 'x'") ~= nil
        "#
    ));
}

// S5 — integer/float keys within the exact-equality range share a slot;
// outside it (2^53+1, an odd integer no float can represent exactly) they don't.
#[test]
fn s5_table_integer_float_key_equivalence() {
    let results = run(
        r#"
        local n = 9007199254740991 -- 2^53-1
        local t = {}
        t[n] = "v"
        local inrange = t[n+0.0]
        local n2 = 9007199254740993
        local t2 = {}
        t2[n2] = "v2"
        local outrange = t2[n2+0.0]
        return inrange, outrange
        "#,
    );
    assert!(matches!(&results[0], LuaValue::Str(s) if s.as_ref() == b"v"));
    assert!(matches!(&results[1], LuaValue::Nil));
}

// Invariant 1 — integer/float arithmetic type rule.
#[test]
fn invariant_arithmetic_type_rule() {
    let results = run(
        r#"
        local i, j = 7, 2
        return math.type(i+j), math.type(i*1.0), math.type(i/j), math.type(i//j)
        "#,
    );
    assert!(matches!(&results[0], LuaValue::Str(s) if s.as_ref() == b"integer"));
    assert!(matches!(&results[1], LuaValue::Str(s) if s.as_ref() == b"float"));
    assert!(matches!(&results[2], LuaValue::Str(s) if s.as_ref() == b"float"));
    assert!(matches!(&results[3], LuaValue::Str(s) if s.as_ref() == b"integer"));
}

// Invariant 2 — an integer and its exact float counterpart are `==` and
// share a table slot, up to maxinteger where that breaks down.
#[test]
fn invariant_integer_float_equality() {
    assert!(run_bool(
        r#"
        local n = 9007199254740991
        local t = {}
        t[n] = "x"
        if not (n == (n + 0.0)) then return false end
        if t[n + 0.0] ~= "x" then return false end
        return math.maxinteger ~= (math.maxinteger + 0.0)
        "#
    ));
}

// Invariant 3 — a chain of vararg-forwarding calls passes the tail through intact.
#[test]
fn invariant_vararg_chain_forwarding() {
    let results = run(
        r#"
        local function f(a, ...) return ... end
        return f(f(f(10, 20, 30, 40, 50)))
        "#,
    );
    assert!(matches!(results.as_slice(), [LuaValue::Integer(40), LuaValue::Integer(50)]));
}

// Invariant 4 — upvalue identity: closures sharing the same captured
// locals report the same upvalue id for the shared slots.
#[test]
fn invariant_upvalue_identity() {
    assert!(run_bool(
        r#"
        local a, b = 1, 2
        local f1 = function() return a + b end
        local f2 = function() return b + a end
        return debug.upvalueid(f1, 1) == debug.upvalueid(f2, 2)
           and debug.upvalueid(f1, 2) == debug.upvalueid(f2, 1)
        "#
    ));
}

// Invariant 5 — a `<close>` handler runs after the return values are
// evaluated, so the caller observes the pre-close snapshot, while the
// handler's own side effect on the outer scope is still visible.
#[test]
fn invariant_close_lifo_and_frozen_returns() {
    let results = run(
        r#"
        local flag = false
        local function mk()
          return setmetatable({}, {__close = function() flag = true end})
        end
        local function f()
          local guard <close> = mk()
          local x, f2 = 99, flag
          return x, f2, 23
        end
        local a, b, c = f()
        return a, b, c, flag
        "#,
    );
    assert!(matches!(&results[0], LuaValue::Integer(99)));
    assert!(matches!(&results[1], LuaValue::Boolean(false)));
    assert!(matches!(&results[2], LuaValue::Integer(23)));
    assert!(matches!(&results[3], LuaValue::Boolean(true)));
}

// S3 — a `__close` handler that tries to `coroutine.yield` cannot
// actually suspend: `<close>` dispatch runs through the same
// synchronous call path every metamethod uses, so the yield surfaces
// as the usual non-yieldable-boundary error instead of a real suspend.
// See SPEC_FULL.md's "[AMBIENT] Test tooling" section and DESIGN.md's
// "S3/S6 test scope" entry for why this is the asserted behavior.
#[test]
fn s3_close_handler_cannot_yield() {
    let mut vm = Vm::new();
    let err = vm
        .exec(
            br#"
            local co = coroutine.create(function()
              local guard <close> = setmetatable({}, {__close = function() coroutine.yield() end})
              return 1
            end)
            local ok, msg = coroutine.resume(co)
            if ok then error("expected resume to report the close-handler's yield failure") end
            error(msg)
            "#,
            "s3",
        )
        .unwrap_err();
    assert!(err.message.contains("yield"), "{}", err.message);
}

// S6 — a line hook fires at least once per loop iteration and at
// least once per top-level statement, without pinning one exact
// firing sequence (see DESIGN.md's "S3/S6 test scope" entry).
#[test]
fn s6_line_hook_fires_per_iteration_and_statement() {
    let results = run(
        r#"
        local hits = 0
        debug.sethook(function() hits = hits + 1 end, "l")
        local x = 0
        for i = 1, 5 do
          x = x + i
        end
        debug.sethook()
        return hits >= 5, x
        "#,
    );
    assert!(matches!(&results[0], LuaValue::Boolean(true)));
    assert!(matches!(&results[1], LuaValue::Integer(15)));
}

// S7 — a coroutine that dies unhandled 4 recursion frames deep keeps a
// traceback naming each frame, inspectable via `debug.traceback` after
// the fact, and that traceback is isolated from an unrelated
// coroutine's own (empty) history. `format_frame_line` doesn't carry a
// Lua closure's declared name (see DESIGN.md's "Dead-coroutine
// traceback preservation" entry), so frames are distinguished by their
// repeated `function <...>` rendering rather than by a literal name.
#[test]
fn s7_dead_coroutine_traceback_is_isolated() {
    let results = run(
        r#"
        local function f(n)
          if n == 0 then error("boom") end
          local r = f(n - 1)
          return r
        end
        local dead = coroutine.create(function() f(3) end)
        local ok, msg = coroutine.resume(dead)
        if ok then error("expected the coroutine body to raise") end
        local dead_tb = debug.traceback(dead, msg)

        local fresh = coroutine.create(function() return 1 end)
        coroutine.resume(fresh)
        local fresh_tb = debug.traceback(fresh, "unrelated")

        local occurrences = 0
        local pos = 1
        while true do
          local s, e = dead_tb:find("function <", pos)
          if not s then break end
          occurrences = occurrences + 1
          pos = e + 1
        end

        return dead_tb:find("boom") ~= nil,
               occurrences >= 4,
               fresh_tb:find("boom") == nil,
               fresh_tb:find("function <") == nil
        "#,
    );
    assert!(matches!(&results[0], LuaValue::Boolean(true)), "{results:?}");
    assert!(matches!(&results[1], LuaValue::Boolean(true)), "{results:?}");
    assert!(matches!(&results[2], LuaValue::Boolean(true)), "{results:?}");
    assert!(matches!(&results[3], LuaValue::Boolean(true)), "{results:?}");
}

// Invariant 10 — pcall wrapping coroutine.resume forwards every value
// the coroutine yields, including the leading resume-success boolean.
#[test]
fn invariant_pcall_coroutine_resume_forwards_all_values() {
    let results = run(
        r#"
        local co = coroutine.create(function()
          coroutine.yield(true, "payload")
        end)
        return pcall(coroutine.resume, co)
        "#,
    );
    assert!(matches!(&results[0], LuaValue::Boolean(true)));
    assert!(matches!(&results[1], LuaValue::Boolean(true)));
    assert!(matches!(&results[2], LuaValue::Boolean(true)));
    assert!(matches!(&results[3], LuaValue::Str(s) if s.as_ref() == b"payload"));
}

// Traceback truncation: a call chain deeper than 22 frames is shown with
// a "(skipping N levels)" marker rather than every frame.
#[test]
fn invariant_traceback_truncates_deep_call_chains() {
    let results = run(
        r#"
        local function rec(n)
          if n == 0 then return debug.traceback("m", 1) end
          return rec(n - 1)
        end
        return rec(30)
        "#,
    );
    match &results[0] {
        LuaValue::Str(s) => {
            let text = String::from_utf8_lossy(s);
            assert!(text.contains("skipping"), "traceback did not truncate: {text}");
        }
        other => panic!("expected a traceback string, got {other:?}"),
    }
}

// `error` prepends a `source:line:` location for string messages at the
// default level, and the location corresponds to the `error()` call site.
#[test]
fn error_message_carries_location_prefix() {
    let mut vm = Vm::new();
    let err = vm.exec(b"local function f() error('boom') end\nf()", "loc").unwrap_err();
    assert!(err.message.contains("boom"));
    assert!(err.message.contains(':'));
}

// coroutine.wrap propagates an error raised inside the coroutine body
// to the caller of the wrapped function, not as a (false, err) pair.
#[test]
fn coroutine_wrap_propagates_errors() {
    let mut vm = Vm::new();
    let err = vm
        .exec(
            br#"
            local co = coroutine.wrap(function() error("inner") end)
            co()
            "#,
            "wrap_err",
        )
        .unwrap_err();
    assert!(err.message.contains("inner"));
}
