use std::env;
use std::sync::Arc;

use tracing::Level;

use gradual_rtti::errors::ErrorPrinter;
use gradual_rtti::rtti::{native, Key, Prototype, Value};
use gradual_rtti::types::*;
use gradual_rtti::{EngineConfig, RttiResult, Runtime};

fn parse_args(args: &[&str], mut config: EngineConfig) -> Option<EngineConfig> {
    for arg in args {
        match *arg {
            "-v" => config.log_level = Level::DEBUG,
            "-vv" => config.log_level = Level::TRACE,
            "-q" => config.log_level = Level::ERROR,
            "--sound" => config.zero_delta_tuples = true,
            "--no-widen" => config.widen_on_any = false,
            "-h" | "--help" => return None,
            other => {
                eprintln!("unknown argument {other}");
                return None;
            }
        }
    }
    Some(config)
}

/// `interface B { bar: string; foo(): string }`, `interface A extends B { baz(): number }`.
fn register_ab(rt: &Runtime) -> RttiResult<(Type, Type)> {
    let b = rt.registry().register_type(NamedDef::interface(
        "B",
        Structured::new()
            .with_field("bar", Field::new(Type::string()))
            .with_method("foo", Arrow::new([], Type::string())),
    ))?;
    let a_members = Structured::new().with_method("baz", Arrow::new([], Type::number()));
    let a = rt
        .registry()
        .register_type(NamedDef::interface("A", a_members).extending("B"))?;
    Ok((a, b))
}

fn width_round_trip(rt: &Runtime, a: &Type, b: &Type) -> RttiResult<String> {
    let foo = rt.new_function(
        Arrow::new([], Type::string()),
        native(|this, _| {
            let bar = this.get(&Key::from_name("bar")).to_js_string();
            Ok(Value::str(&format!("foo of {bar}")))
        }),
    );
    let baz = rt.new_function(
        Arrow::new([], Type::number()),
        native(|_, _| Ok(Value::Number(7.0))),
    );
    let value = rt.new_record(None, [("bar", Value::str("hello")), ("foo", foo), ("baz", baz)]);
    value.set_tag(a.clone());

    let slot = Type::record(Structured::new().with_field("0", Field::new(b.clone())));
    let tuple = rt.new_tuple(slot.clone(), vec![Value::Undefined]);
    rt.write_field(&tuple, &slot, &Value::Number(0.0), value, a)?;

    let back = rt.read_field(&tuple, &slot, &Value::Number(0.0))?;
    let bar = rt.read_field(&back, b, &Value::str("bar"))?;
    let foo = rt.call_method(&back, b, "foo", &[], &[])?;
    Ok(format!("bar = {}, foo() = {}", bar.to_js_string(), foo.to_js_string()))
}

fn dynamic_add(rt: &Arc<Runtime>) -> RttiResult<Value> {
    let inner = rt.clone();
    let add = rt.new_function(
        Arrow::new([Type::Any, Type::Any], Type::Any),
        native(move |_, args| {
            let a = inner.check_and_tag(args[0].clone(), &Type::Any, &Type::number())?;
            let b = inner.check_and_tag(args[1].clone(), &Type::Any, &Type::number())?;
            Ok(Value::Number(a.to_number() + b.to_number()))
        }),
    );

    rt.call_function_n(
        &add,
        &Type::Any,
        [Value::Number(5.0), Value::str("8")],
        [Type::number(), Type::string()],
    )
}

fn register_animals(rt: &Runtime) -> RttiResult<()> {
    let animal = Arc::new(Prototype::new("Animal"));
    let dog = Arc::new(Prototype::new("Dog").extending(animal.clone()));
    rt.registry().register_class(ClassDef::new("Animal", animal))?;

    let mut dog_def = ClassDef::new("Dog", dog);
    dog_def.base = Some("Animal".into());
    rt.registry().register_class(dog_def)?;
    Ok(())
}

fn instance_check(rt: &Runtime, from: &str, to: &str) -> RttiResult<String> {
    let from = Type::Instance(rt.registry().named_type(from, NamedKind::Instance)?);
    let to = Type::Instance(rt.registry().named_type(to, NamedKind::Instance)?);

    let value = rt.new_instance(&from, [])?;
    let value = rt.check_and_tag(value, &Type::Any, &to)?;
    Ok(format!("{:?}", value))
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let sliced: Vec<&str> = args.iter().skip(1).map(|s| &s[..]).collect();

    let config = match parse_args(&sliced, EngineConfig::from_env()) {
        Some(c) => c,
        None => {
            eprintln!("usage: rtti [-v | -vv | -q] [--sound] [--no-widen]");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt().with_max_level(config.log_level).init();
    tracing::debug!("starting with {:?}", config);

    let rt = Arc::new(Runtime::new(config));
    let printer = ErrorPrinter {};
    let mut failed = false;

    let types = register_ab(&rt).and_then(|ab| register_animals(&rt).map(|_| ab));
    rt.registry().freeze();
    let (a, b) = match types {
        Ok(ab) => ab,
        Err(e) => {
            printer.report("registration", &e);
            std::process::exit(1);
        }
    };

    match width_round_trip(&rt, &a, &b) {
        Ok(s) => printer.success("A-tagged value through a [B] slot", &s),
        Err(e) => {
            failed = true;
            printer.report("A-tagged value through a [B] slot", &e);
        }
    }

    // expected to fail: the string operand reaches a numeric `+`
    match dynamic_add(&rt) {
        Ok(v) => {
            failed = true;
            printer.success("add(5, '8')", &v.to_js_string());
        }
        Err(e) => printer.report("add(5, '8')", &e),
    }

    match instance_check(&rt, "Dog", "Animal") {
        Ok(s) => printer.success("Dog as Animal", &s),
        Err(e) => {
            failed = true;
            printer.report("Dog as Animal", &e);
        }
    }

    // expected to fail: an Animal is not a Dog
    match instance_check(&rt, "Animal", "Dog") {
        Ok(s) => {
            failed = true;
            printer.success("Animal as Dog", &s);
        }
        Err(e) => printer.report("Animal as Dog", &e),
    }

    if failed {
        std::process::exit(1);
    }
}
