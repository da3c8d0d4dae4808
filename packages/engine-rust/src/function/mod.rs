//! Managed functions, their declared signatures and the context they run in.
//!
//! A [`FunctionType`] declares what a function needs (object dependencies
//! with their types), what it may do (flows, escalation types) and what it
//! takes (parameter type). The office loader checks descriptors against the
//! signature, so a function only sees index and type mismatches if the
//! signature itself lies.

use std::any::Any;
use std::sync::Arc;

use officefloor_core::{EngineEscalation, Escalation, ParameterType, ProcessId, ThreadId, Value};

use crate::managed_object::{ObjectRef, ObjectType};
use crate::team::JobContext;

// ---------------------------------------------------------------------------
// ManagedFunction
// ---------------------------------------------------------------------------

/// The executable unit of work.
///
/// The returned value becomes the argument of the function's `next`
/// continuation.
pub trait ManagedFunction: Send + Sync + 'static {
    /// Runs the function.
    ///
    /// # Errors
    ///
    /// Returns an escalation, which the engine routes through the handler
    /// chain.
    fn execute(&self, context: &mut FunctionContext<'_>) -> Result<Option<Value>, Escalation>;
}

impl<F> ManagedFunction for F
where
    F: Fn(&mut FunctionContext<'_>) -> Result<Option<Value>, Escalation> + Send + Sync + 'static,
{
    fn execute(&self, context: &mut FunctionContext<'_>) -> Result<Option<Value>, Escalation> {
        self(context)
    }
}

// ---------------------------------------------------------------------------
// FunctionType
// ---------------------------------------------------------------------------

/// A registered function together with its declared signature.
#[derive(Clone)]
pub struct FunctionType {
    function: Arc<dyn ManagedFunction>,
    objects: Vec<(String, ObjectType)>,
    flows: Vec<String>,
    escalations: Vec<String>,
    parameter: Option<ParameterType>,
}

impl FunctionType {
    /// Wraps a closure as a function type.
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(&mut FunctionContext<'_>) -> Result<Option<Value>, Escalation> + Send + Sync + 'static,
    {
        Self::from_function(Arc::new(function))
    }

    /// Wraps any [`ManagedFunction`] implementation.
    #[must_use]
    pub fn from_function(function: Arc<dyn ManagedFunction>) -> Self {
        Self {
            function,
            objects: Vec::new(),
            flows: Vec::new(),
            escalations: Vec::new(),
            parameter: None,
        }
    }

    /// Declares an object dependency. Dependencies are indexed in
    /// declaration order.
    #[must_use]
    pub fn object<T: Any>(mut self, key: impl Into<String>) -> Self {
        self.objects.push((key.into(), ObjectType::of::<T>()));
        self
    }

    /// Declares a flow. Flows are indexed in declaration order.
    #[must_use]
    pub fn flow(mut self, key: impl Into<String>) -> Self {
        self.flows.push(key.into());
        self
    }

    /// Declares an escalation type the function may raise.
    #[must_use]
    pub fn escalation(mut self, escalation_type: impl Into<String>) -> Self {
        self.escalations.push(escalation_type.into());
        self
    }

    #[must_use]
    pub fn parameter(mut self, parameter: ParameterType) -> Self {
        self.parameter = Some(parameter);
        self
    }

    #[must_use]
    pub fn function(&self) -> &Arc<dyn ManagedFunction> {
        &self.function
    }

    #[must_use]
    pub fn objects(&self) -> &[(String, ObjectType)] {
        &self.objects
    }

    #[must_use]
    pub fn flows(&self) -> &[String] {
        &self.flows
    }

    #[must_use]
    pub fn escalations(&self) -> &[String] {
        &self.escalations
    }

    #[must_use]
    pub fn parameter_type(&self) -> Option<ParameterType> {
        self.parameter
    }
}

// ---------------------------------------------------------------------------
// FunctionContext
// ---------------------------------------------------------------------------

/// Identity of the job a function runs in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Invoker<'a> {
    pub function: &'a str,
    pub process_id: ProcessId,
    pub thread_id: ThreadId,
    pub job: &'a JobContext,
}

/// What a function sees while it runs.
pub struct FunctionContext<'a> {
    invoker: Invoker<'a>,
    parameter: Option<Value>,
    escalation: Option<Escalation>,
    objects: Vec<ObjectRef>,
    object_keys: &'a [String],
    flow_keys: &'a [String],
    flows: Vec<(usize, Option<Value>)>,
}

impl<'a> FunctionContext<'a> {
    pub(crate) fn new(
        invoker: Invoker<'a>,
        parameter: Option<Value>,
        escalation: Option<Escalation>,
        objects: Vec<ObjectRef>,
        object_keys: &'a [String],
        flow_keys: &'a [String],
    ) -> Self {
        Self {
            invoker,
            parameter,
            escalation,
            objects,
            object_keys,
            flow_keys,
            flows: Vec::new(),
        }
    }

    /// The argument passed to this invocation.
    #[must_use]
    pub fn parameter(&self) -> Option<&Value> {
        self.parameter.as_ref()
    }

    /// Takes ownership of the argument.
    pub fn take_parameter(&mut self) -> Option<Value> {
        self.parameter.take()
    }

    /// The escalation being handled, when running as an escalation handler.
    #[must_use]
    pub fn escalation(&self) -> Option<&Escalation> {
        self.escalation.as_ref()
    }

    /// Returns object dependency `index`.
    ///
    /// # Errors
    ///
    /// Returns an escalation if the index is out of range or the object is
    /// not a `T`.
    pub fn object<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>, Escalation> {
        let Some(object) = self.objects.get(index) else {
            return Err(EngineEscalation::UnknownDependency {
                function: self.invoker.function.to_string(),
                dependency: index.to_string(),
            }
            .into());
        };
        Arc::clone(object).downcast::<T>().map_err(|_| {
            EngineEscalation::ObjectType {
                function: self.invoker.function.to_string(),
                dependency: self
                    .object_keys
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| index.to_string()),
                expected: std::any::type_name::<T>(),
            }
            .into()
        })
    }

    /// Returns the object dependency declared under `key`.
    ///
    /// # Errors
    ///
    /// Returns an escalation if no dependency has that key or the object is
    /// not a `T`.
    pub fn object_by_key<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, Escalation> {
        let index = self
            .object_keys
            .iter()
            .position(|name| name == key)
            .ok_or_else(|| EngineEscalation::UnknownDependency {
                function: self.invoker.function.to_string(),
                dependency: key.to_string(),
            })?;
        self.object(index)
    }

    /// Instigates flow `index` with `argument`. Flows start after the
    /// function returns successfully.
    ///
    /// # Errors
    ///
    /// Returns an escalation if the function declares no such flow.
    pub fn do_flow(&mut self, index: usize, argument: Option<Value>) -> Result<(), Escalation> {
        if index >= self.flow_keys.len() {
            return Err(EngineEscalation::UnknownFlow {
                function: self.invoker.function.to_string(),
                flow: index.to_string(),
            }
            .into());
        }
        self.flows.push((index, argument));
        Ok(())
    }

    /// Instigates the flow declared under `key`.
    ///
    /// # Errors
    ///
    /// Returns an escalation if the function declares no such flow.
    pub fn do_flow_by_key(&mut self, key: &str, argument: Option<Value>) -> Result<(), Escalation> {
        let index = self
            .flow_keys
            .iter()
            .position(|name| name == key)
            .ok_or_else(|| EngineEscalation::UnknownFlow {
                function: self.invoker.function.to_string(),
                flow: key.to_string(),
            })?;
        self.do_flow(index, argument)
    }

    /// Returns `false` once the team is stopping.
    #[must_use]
    pub fn continue_execution(&self) -> bool {
        self.invoker.job.continue_execution()
    }

    /// Coarse current time in milliseconds.
    #[must_use]
    pub fn time_millis(&self) -> u64 {
        self.invoker.job.time_millis()
    }

    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.invoker.process_id
    }

    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.invoker.thread_id
    }

    #[must_use]
    pub fn function_name(&self) -> &str {
        self.invoker.function
    }

    pub(crate) fn into_flows(self) -> Vec<(usize, Option<Value>)> {
        self.flows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::team::MonitorClock;

    #[derive(Debug)]
    struct Counter(u32);

    fn run(
        function_type: &FunctionType,
        objects: Vec<ObjectRef>,
        parameter: Option<Value>,
    ) -> (Result<Option<Value>, Escalation>, Vec<(usize, Option<Value>)>) {
        let job = JobContext::detached(MonitorClock::new());
        let object_keys: Vec<String> = function_type
            .objects()
            .iter()
            .map(|(key, _)| key.clone())
            .collect();
        let mut context = FunctionContext::new(
            Invoker {
                function: "count",
                process_id: ProcessId(1),
                thread_id: ThreadId(2),
                job: &job,
            },
            parameter,
            None,
            objects,
            &object_keys,
            function_type.flows(),
        );
        let result = function_type.function().execute(&mut context);
        (result, context.into_flows())
    }

    #[test]
    fn closure_functions_see_objects_and_parameters() {
        let function_type = FunctionType::new(|context: &mut FunctionContext<'_>| {
            let counter = context.object_by_key::<Counter>("counter")?;
            let step = context.parameter().and_then(Value::as_int).unwrap_or(0);
            Ok(Some(Value::Int(i64::from(counter.0) + step)))
        })
        .object::<Counter>("counter")
        .parameter(ParameterType::Int);

        let (result, flows) = run(&function_type, vec![Arc::new(Counter(40))], Some(Value::Int(2)));
        assert_eq!(result.unwrap(), Some(Value::Int(42)));
        assert!(flows.is_empty());
        assert_eq!(function_type.parameter_type(), Some(ParameterType::Int));
    }

    #[test]
    fn wrong_object_type_is_an_escalation() {
        let function_type = FunctionType::new(|context: &mut FunctionContext<'_>| {
            context.object::<String>(0)?;
            Ok(None)
        })
        .object::<Counter>("counter");

        let (result, _) = run(&function_type, vec![Arc::new(Counter(1))], None);
        let escalation = result.unwrap_err();
        assert!(matches!(
            escalation.downcast_ref::<EngineEscalation>(),
            Some(EngineEscalation::ObjectType { dependency, .. }) if dependency == "counter"
        ));
    }

    #[test]
    fn flows_are_recorded_in_order() {
        let function_type = FunctionType::new(|context: &mut FunctionContext<'_>| {
            context.do_flow_by_key("audit", Some(Value::from("a")))?;
            context.do_flow(0, None)?;
            assert!(context.do_flow(5, None).is_err());
            assert!(context.do_flow_by_key("missing", None).is_err());
            Ok(None)
        })
        .flow("notify")
        .flow("audit")
        .escalation("any");

        let (result, flows) = run(&function_type, Vec::new(), None);
        assert!(result.is_ok());
        assert_eq!(flows, vec![(1, Some(Value::from("a"))), (0, None)]);
        assert_eq!(function_type.escalations(), ["any".to_string()]);
    }
}
