//! Reflective dispatch resolver
//!
//! Matches guest-originated member accesses against explicitly registered
//! host classes, coerces the guest arguments, runs the member and pushes
//! the result back onto the guest stack.

mod class;
mod coerce;
mod resolver;

pub use class::{
    ClassBuilder, ClassDef, ClassId, ClassRegistry, ConstructorDef, ElementGetter, ElementSetter,
    ElementsDef, Factory, FieldDef, Getter, Invoke, Invoker, Length, MethodDef, Setter,
};
pub use coerce::{accepts, extract, Arg, ParamType};
pub use resolver::{
    array_index, array_new_index, class_index, construct, field_read, field_write,
    new_instance_by_name, object_index, resolve_method, Invocation, MemberKind, Target,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOptions;
    use crate::error::BridgeError;
    use crate::session::Session;
    use crate::value::{HostObject, HostValue};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Counter {
        value: Mutex<f64>,
    }

    struct Named;

    struct Samples(Mutex<Vec<f64>>);

    fn samples(this: &HostObject) -> Result<&Mutex<Vec<f64>>, crate::error::HostError> {
        this.downcast_ref::<Samples>()
            .map(|s| &s.0)
            .ok_or_else(|| "not samples".into())
    }

    fn samples_class(classes: &ClassRegistry) -> ClassId {
        classes
            .register(
                ClassBuilder::for_type::<Samples>("Samples")
                    .elements_mut(
                        ParamType::Int,
                        |this| Ok(samples(this)?.lock().len()),
                        |this, i| Ok(HostValue::Number(samples(this)?.lock()[i])),
                        |this, i, value| {
                            samples(this)?.lock()[i] = value.as_f64().unwrap_or_default();
                            Ok(())
                        },
                    ),
            )
            .unwrap()
    }

    fn session_with(build: impl FnOnce(&ClassRegistry)) -> Arc<Session> {
        let classes = Arc::new(ClassRegistry::new());
        build(&classes);
        Session::with_options(SessionOptions::new().with_classes(classes))
    }

    fn counter_class(classes: &ClassRegistry) -> ClassId {
        classes
            .register(
                ClassBuilder::for_type::<Counter>("Counter")
                    .constructor(Vec::new(), |_| {
                        Ok(HostObject::new(Counter {
                            value: Mutex::new(0.0),
                        }))
                    })
                    .constructor([ParamType::Double], |call| {
                        let start = call.arg(0).as_f64().unwrap_or_default();
                        Ok(HostObject::new(Counter {
                            value: Mutex::new(start),
                        }))
                    })
                    .field_mut(
                        "value",
                        ParamType::Double,
                        |this| {
                            let counter = this.downcast_ref::<Counter>().ok_or("not a counter")?;
                            Ok(HostValue::Number(*counter.value.lock()))
                        },
                        |this, arg| {
                            let counter = this.downcast_ref::<Counter>().ok_or("not a counter")?;
                            *counter.value.lock() = arg.as_f64().unwrap_or_default();
                            Ok(())
                        },
                    )
                    .static_field("LIMIT", ParamType::Int, || Ok(HostValue::Number(10.0)))
                    .method("add", [ParamType::Int], |call| {
                        let counter = call.this::<Counter>()?;
                        let mut value = counter.value.lock();
                        *value += call.arg(0).as_f64().unwrap_or_default();
                        Ok(Some(HostValue::Number(*value)))
                    })
                    .method("reset", Vec::new(), |call| {
                        *call.this::<Counter>()?.value.lock() = 0.0;
                        Ok(None)
                    })
                    .method("fail", Vec::new(), |_| Err("counter jammed".into())),
            )
            .unwrap()
    }

    #[test]
    fn test_resolve_and_invoke() {
        let session = session_with(|c| {
            counter_class(c);
        });
        let object = session.new_instance("Counter", &[5.0.into()]).unwrap();
        let target = Target::Instance(object);

        let result = session.call_method(&target, "add", &[2.0.into()]).unwrap();
        assert_eq!(result, HostValue::Number(7.0));
        assert_eq!(session.call_method(&target, "reset", &[]).unwrap(), HostValue::Nil);
        assert_eq!(session.get_field(&target, "value").unwrap(), HostValue::Number(0.0));
        assert_eq!(session.get_top(), 0);
    }

    #[test]
    fn test_errors_are_typed() {
        let session = session_with(|c| {
            counter_class(c);
        });
        let target = Target::Instance(session.new_instance("Counter", &[]).unwrap());

        assert!(matches!(
            session.call_method(&target, "missing", &[]),
            Err(BridgeError::NoSuchMember { .. })
        ));
        assert!(matches!(
            session.call_method(&target, "add", &["x".into()]),
            Err(BridgeError::NoMatchingOverload { .. })
        ));
        let err = session.call_method(&target, "fail", &[]).unwrap_err();
        assert!(matches!(err, BridgeError::Invocation { .. }));
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()).as_deref(),
            Some("counter jammed")
        );
        assert_eq!(session.get_top(), 0);
    }

    #[test]
    fn test_first_declared_overload_wins() {
        let session = session_with(|c| {
            c.register(
                ClassBuilder::new("Greeter")
                    .static_method("f", [ParamType::Any], |_| Ok(Some("any".into())))
                    .static_method("f", [ParamType::String], |_| Ok(Some("string".into()))),
            )
            .unwrap();
        });
        let class = session.classes().by_name("Greeter").unwrap().id;
        let result = session
            .call_method(&Target::Class(class), "f", &["hi".into()])
            .unwrap();
        assert_eq!(result, HostValue::String("any".to_string()));
    }

    #[test]
    fn test_hierarchy_walk() {
        let session = session_with(|c| {
            let base = c
                .register(
                    ClassBuilder::new("Base")
                        .static_method("who", Vec::new(), |_| Ok(Some("base".into())))
                        .static_method("only_base", Vec::new(), |_| Ok(Some(1.into()))),
                )
                .unwrap();
            c.register(
                ClassBuilder::for_type::<Named>("Derived")
                    .extends(base)
                    .static_method("who", Vec::new(), |_| Ok(Some("derived".into()))),
            )
            .unwrap();
        });
        let target = Target::Instance(HostObject::new(Named));
        assert_eq!(
            session.call_method(&target, "who", &[]).unwrap(),
            HostValue::String("derived".to_string())
        );
        assert_eq!(
            session.call_method(&target, "only_base", &[]).unwrap(),
            HostValue::Number(1.0)
        );
    }

    #[test]
    fn test_static_access_rules() {
        let session = session_with(|c| {
            counter_class(c);
        });
        let class = session.classes().by_name("Counter").unwrap().id;
        let target = Target::Class(class);

        assert_eq!(session.get_field(&target, "LIMIT").unwrap(), HostValue::Number(10.0));
        assert!(matches!(
            session.call_method(&target, "reset", &[]),
            Err(BridgeError::Invocation { .. })
        ));
        assert!(matches!(
            session.get_field(&target, "value"),
            Err(BridgeError::Invocation { .. })
        ));
    }

    #[test]
    fn test_field_write_coerces() {
        let session = session_with(|c| {
            counter_class(c);
        });
        let target = Target::Instance(session.new_instance("Counter", &[]).unwrap());

        session.set_field(&target, "value", &4.5.into()).unwrap();
        assert_eq!(session.get_field(&target, "value").unwrap(), HostValue::Number(4.5));
        assert!(matches!(
            session.set_field(&target, "value", &true.into()),
            Err(BridgeError::NoMatchingOverload { .. })
        ));
        let class = session.classes().by_name("Counter").unwrap().id;
        assert!(matches!(
            session.set_field(&Target::Class(class), "LIMIT", &1.0.into()),
            Err(BridgeError::InvalidTarget(_))
        ));
        assert_eq!(session.get_top(), 0);
    }

    #[test]
    fn test_class_index_kinds() {
        let session = session_with(|c| {
            counter_class(c);
        });
        let class = session.classes().by_name("Counter").unwrap().id;
        let target = Target::Class(class);

        let state = session.lock();
        assert_eq!(class_index(&session, &target, "LIMIT").unwrap(), MemberKind::Field);
        assert_eq!(state.to_number(-1), Some(10.0));
        state.pop(1).unwrap();
        assert_eq!(class_index(&session, &target, "add").unwrap(), MemberKind::Method);
        assert_eq!(class_index(&session, &target, "nope").unwrap(), MemberKind::None);
        assert_eq!(state.get_top(), 0);
    }

    #[test]
    fn test_constructor_selection() {
        let session = session_with(|c| {
            counter_class(c);
            c.register(ClassBuilder::new("Abstract")).unwrap();
        });
        assert!(matches!(
            session.new_instance("Counter", &["x".into()]),
            Err(BridgeError::NoMatchingOverload { .. })
        ));
        assert!(matches!(
            session.new_instance("Abstract", &[]),
            Err(BridgeError::NoSuchMember { .. })
        ));
        assert!(matches!(
            session.new_instance("Nowhere", &[]),
            Err(BridgeError::InvalidTarget(_))
        ));
        assert_eq!(session.get_top(), 0);
    }

    #[test]
    fn test_target_from_stack() {
        let session = session_with(|c| {
            counter_class(c);
        });
        let class = session.classes().by_name("Counter").unwrap().id;
        session.push_class(class).unwrap();
        session.push_object(HostObject::new(Named)).unwrap();

        let state = session.lock();
        assert_eq!(Target::from_stack(&state, 1).unwrap(), Target::Class(class));
        assert!(matches!(
            Target::from_stack(&state, 2).unwrap(),
            Target::Instance(_)
        ));
        state.push_number(1.0).unwrap();
        assert!(matches!(
            Target::from_stack(&state, 3),
            Err(BridgeError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_element_access() {
        let session = session_with(|c| {
            samples_class(c);
        });
        let target = Target::Instance(HostObject::new(Samples(Mutex::new(vec![1.0, 2.0]))));

        assert_eq!(session.get_element(&target, 2).unwrap(), HostValue::Number(2.0));
        session.set_element(&target, 1, &9.7.into()).unwrap();
        assert_eq!(session.get_element(&target, 1).unwrap(), HostValue::Number(9.0));
        assert_eq!(session.get_top(), 0);
    }

    #[test]
    fn test_element_bounds_keep_stack() {
        let session = session_with(|c| {
            samples_class(c);
            counter_class(c);
        });
        let target = Target::Instance(HostObject::new(Samples(Mutex::new(vec![1.0, 2.0]))));
        let state = session.lock();
        state.push_string("below").unwrap();

        for position in [0, 3, -1, i64::MAX] {
            assert!(matches!(
                session.get_element(&target, position),
                Err(BridgeError::IndexOutOfBounds { len: 2, .. })
            ));
            assert!(matches!(
                session.set_element(&target, position, &1.0.into()),
                Err(BridgeError::IndexOutOfBounds { len: 2, .. })
            ));
            assert_eq!(state.get_top(), 1);
        }
        assert!(matches!(
            session.set_element(&target, 1, &"x".into()),
            Err(BridgeError::InvalidArgument(_))
        ));

        let counter = Target::Instance(session.new_instance("Counter", &[]).unwrap());
        assert!(matches!(
            session.get_element(&counter, 1),
            Err(BridgeError::InvalidTarget(_))
        ));
        let class = session.classes().by_name("Samples").unwrap().id;
        assert!(matches!(
            session.get_element(&Target::Class(class), 1),
            Err(BridgeError::InvalidTarget(_))
        ));
        assert_eq!(state.get_top(), 1);
    }
}
