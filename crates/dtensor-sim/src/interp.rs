//! Tree-walking executor.
//!
//! Every placed op of the called function runs in program order; nested
//! clusters run inline and `Case` calls the selected branch function with the
//! forwarded operands. Host transfer primitives run regardless of which
//! device they name, so one run of a receiving function drains every channel
//! its receives address.

use dtensor_common::Mesh;
use dtensor_ir::{BlockId, FuncId, Module, OpData, OpId, OpKind, TensorType, ValueId};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::rendezvous::{DeviceChannel, Direction, HostChannel, Rendezvous};
use crate::tensor::{Tensor, TensorData};
use crate::SimError;

type Env = FxHashMap<ValueId, Tensor>;

/// Where the current op runs.
#[derive(Debug, Clone, Copy)]
struct Frame<'m> {
    device_id: i32,
    /// Mesh of the innermost enclosing cluster that has one.
    mesh: Option<&'m Mesh>,
}

impl Frame<'_> {
    /// Local ordinal of the executing device, used by device-side
    /// accelerator transfers.
    fn ordinal(&self) -> i64 {
        let id = i64::from(self.device_id);
        self.mesh
            .and_then(|mesh| mesh.local_device_ids().iter().position(|&local| local == id))
            .map_or(id, |ordinal| ordinal as i64)
    }
}

fn input(inputs: &[Tensor], index: usize) -> Result<&Tensor, SimError> {
    inputs
        .get(index)
        .ok_or_else(|| SimError::Type(format!("missing operand {index}")))
}

fn result_type<'m>(
    module: &'m Module,
    data: &OpData,
    index: usize,
) -> Result<&'m TensorType, SimError> {
    data.results
        .get(index)
        .map(|&v| module.value_type(v))
        .ok_or_else(|| SimError::Type(format!("{} has no result {index}", data.kind.name())))
}

/// Executes functions of lowered modules against a shared [`Rendezvous`].
#[derive(Debug, Default)]
pub struct Interpreter {
    rendezvous: Rendezvous,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    pub fn rendezvous_mut(&mut self) -> &mut Rendezvous {
        &mut self.rendezvous
    }

    /// Run `function` as device `device_id`. The device id is passed as the
    /// function's first parameter, followed by `args`.
    pub fn run(
        &mut self,
        module: &Module,
        function: &str,
        device_id: i32,
        args: Vec<Tensor>,
    ) -> Result<Vec<Tensor>, SimError> {
        let func = module
            .lookup_function(function)
            .ok_or_else(|| SimError::UnknownFunction(function.to_string()))?;
        debug!(function, device_id, "running function");
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(Tensor::scalar_i32(device_id));
        all.extend(args);
        let frame = Frame {
            device_id,
            mesh: None,
        };
        self.call(module, func, all, frame)
    }

    fn call<'m>(
        &mut self,
        module: &'m Module,
        func: FuncId,
        args: Vec<Tensor>,
        frame: Frame<'m>,
    ) -> Result<Vec<Tensor>, SimError> {
        let params = module.args(func);
        if params.len() != args.len() {
            return Err(SimError::Arity {
                name: module.function(func).name.clone(),
                expected: params.len(),
                got: args.len(),
            });
        }
        let mut env: Env = params.iter().copied().zip(args).collect();
        let entry = module.function(func).entry;
        Ok(self
            .exec_block(module, entry, &mut env, frame)?
            .unwrap_or_default())
    }

    /// Run the ops of `block`; `Some` once a `Return` executes.
    fn exec_block<'m>(
        &mut self,
        module: &'m Module,
        block: BlockId,
        env: &mut Env,
        frame: Frame<'m>,
    ) -> Result<Option<Vec<Tensor>>, SimError> {
        for &op in &module.block(block).ops {
            if let Some(returned) = self.exec_op(module, op, env, frame)? {
                return Ok(Some(returned));
            }
        }
        Ok(None)
    }

    fn exec_op<'m>(
        &mut self,
        module: &'m Module,
        op: OpId,
        env: &mut Env,
        frame: Frame<'m>,
    ) -> Result<Option<Vec<Tensor>>, SimError> {
        let data = module.op(op);
        let inputs = data
            .operands
            .iter()
            .map(|v| env.get(v).cloned().ok_or(SimError::Undefined(*v)))
            .collect::<Result<Vec<_>, _>>()?;
        trace!(op = data.kind.name(), device_id = frame.device_id, "exec");

        let outputs = match &data.kind {
            OpKind::Cluster { mesh } => {
                let frame = Frame {
                    mesh: mesh.as_ref().or(frame.mesh),
                    ..frame
                };
                if let Some(returned) = self.exec_block(module, data.regions[0], env, frame)? {
                    return Ok(Some(returned));
                }
                Vec::new()
            }
            OpKind::Return => return Ok(Some(inputs)),
            OpKind::DTensorSend { .. } | OpKind::DTensorRecv { .. } => {
                return Err(SimError::Unlowered {
                    op: data.kind.name(),
                })
            }

            OpKind::Const { value } => {
                vec![Tensor::from_literal(value, result_type(module, data, 0)?)?]
            }
            OpKind::Reshape => {
                let shape = result_type(module, data, 0)?.shape.clone();
                vec![input(&inputs, 0)?.reshape(shape)?]
            }
            OpKind::Slice => {
                let begin = input(&inputs, 1)?.to_i64s()?;
                let size = input(&inputs, 2)?.to_i64s()?;
                vec![input(&inputs, 0)?.slice(&begin, &size)?]
            }
            OpKind::Cast => {
                let element = result_type(module, data, 0)?.element;
                vec![input(&inputs, 0)?.cast(element)?]
            }
            OpKind::Add => vec![input(&inputs, 0)?.add(input(&inputs, 1)?)?],

            OpKind::HostSend {
                key,
                send_device,
                recv_device,
                ..
            } => {
                let channel = HostChannel::new(key, send_device, recv_device);
                self.rendezvous.send_host(channel, input(&inputs, 0)?.clone());
                Vec::new()
            }
            OpKind::HostRecv {
                key,
                send_device,
                recv_device,
                ..
            } => {
                let channel = HostChannel::new(key, send_device, recv_device);
                let value = self.rendezvous.recv_host(&channel).ok_or_else(|| {
                    SimError::MissingTransfer {
                        key: key.clone(),
                        device: recv_device.clone(),
                    }
                })?;
                vec![value]
            }

            OpKind::XlaSendFromHost { key } => {
                if inputs.len() < 2 {
                    return Err(SimError::Type(format!(
                        "{} needs a program key and an ordinal",
                        data.kind.name()
                    )));
                }
                let (values, tail) = inputs.split_at(inputs.len() - 2);
                let channel = DeviceChannel {
                    key: key.clone(),
                    ordinal: tail[1].as_index()?,
                    direction: Direction::ToDevice,
                };
                for value in values {
                    self.rendezvous.send_device(channel.clone(), value.clone());
                }
                Vec::new()
            }
            OpKind::XlaSendToHost { key } => {
                let channel = DeviceChannel {
                    key: key.clone(),
                    ordinal: frame.ordinal(),
                    direction: Direction::ToHost,
                };
                self.rendezvous.send_device(channel, input(&inputs, 0)?.clone());
                Vec::new()
            }
            OpKind::XlaRecvAtHost { key } => {
                let ordinal = input(&inputs, 1)?.as_index()?;
                vec![self.recv_device(key, ordinal, Direction::ToHost)?]
            }
            OpKind::XlaRecvFromHost { key, .. } => {
                vec![self.recv_device(key, frame.ordinal(), Direction::ToDevice)?]
            }
            OpKind::CompilationKeyPlaceholder => {
                let keys = vec!["program".to_string(); 3];
                vec![Tensor::new(vec![3], TensorData::Str(keys))?]
            }

            OpKind::Case { branches, .. } => {
                let index = input(&inputs, 0)?.as_index()?;
                let name = usize::try_from(index)
                    .ok()
                    .and_then(|i| branches.get(i))
                    .ok_or(SimError::BranchOutOfRange {
                        index,
                        branches: branches.len(),
                    })?;
                let func = module
                    .lookup_function(name)
                    .ok_or_else(|| SimError::UnknownFunction(name.clone()))?;
                trace!(branch = %name, index, "dispatch");
                self.call(module, func, inputs[1..].to_vec(), frame)?
            }
        };

        for (&value, tensor) in data.results.iter().zip(outputs) {
            env.insert(value, tensor);
        }
        Ok(None)
    }

    fn recv_device(
        &mut self,
        key: &str,
        ordinal: i64,
        direction: Direction,
    ) -> Result<Tensor, SimError> {
        let channel = DeviceChannel {
            key: key.to_string(),
            ordinal,
            direction,
        };
        self.rendezvous
            .recv_device(&channel)
            .ok_or_else(|| SimError::MissingTransfer {
                key: key.to_string(),
                device: format!("device ordinal {ordinal}"),
            })
    }
}
