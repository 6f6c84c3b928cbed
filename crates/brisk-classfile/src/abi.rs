use brisk_hash::{HashCode, Hasher};

use crate::classfile::{access, ClassFile, ClassMember, ConstValue};
use crate::error::Result;

const ABI_FORMAT: &str = "class-abi-v1";

/// Whether a member contributes to the ABI of its class.
pub fn is_abi_visible(access_flags: u16) -> bool {
    access_flags & (access::PRIVATE | access::SYNTHETIC) == 0
}

/// Parses `bytes` and hashes the class ABI. See [`class_abi_hash`].
pub fn abi_hash(bytes: &[u8]) -> Result<Option<HashCode>> {
    let class = ClassFile::parse(bytes)?;
    Ok(class_abi_hash(&class))
}

/// Hashes only what other classes compile against.
///
/// Included: the class name, super class, interfaces (sorted), class access flags (without
/// `ACC_SUPER`), and every non-private, non-synthetic field and method. Fields contribute name,
/// descriptor, access flags, and constant value; methods contribute name, descriptor, access
/// flags, and declared exceptions (sorted). Members are sorted by name and descriptor. Method
/// bodies, static initializers, and debug information do not contribute.
///
/// Returns `None` for private, synthetic, and private nested classes, which have no ABI.
pub fn class_abi_hash(class: &ClassFile) -> Option<HashCode> {
    let nested_flags = class.inner_access_flags.unwrap_or(0);
    if !is_abi_visible(class.access_flags) || !is_abi_visible(nested_flags) {
        return None;
    }

    let mut hasher = Hasher::new();
    hasher.put_str(ABI_FORMAT);
    hasher.put_str(&class.this_class);
    hasher.put_str(class.super_class.as_deref().unwrap_or(""));
    hasher.put_u64(u64::from(class.access_flags & !access::SUPER));

    let mut interfaces: Vec<&str> = class.interfaces.iter().map(String::as_str).collect();
    interfaces.sort_unstable();
    hasher.put_u64(interfaces.len() as u64);
    for interface in interfaces {
        hasher.put_str(interface);
    }

    let fields = visible_members(&class.fields, false);
    hasher.put_u64(fields.len() as u64);
    for field in fields {
        put_member_header(&mut hasher, field);
        match &field.constant_value {
            None => hasher.put_bool(false),
            Some(value) => {
                hasher.put_bool(true);
                put_constant(&mut hasher, value)
            }
        };
    }

    let methods = visible_members(&class.methods, true);
    hasher.put_u64(methods.len() as u64);
    for method in methods {
        put_member_header(&mut hasher, method);
        let mut exceptions: Vec<&str> = method.exceptions.iter().map(String::as_str).collect();
        exceptions.sort_unstable();
        hasher.put_u64(exceptions.len() as u64);
        for exception in exceptions {
            hasher.put_str(exception);
        }
    }

    Some(hasher.finish())
}

fn visible_members(members: &[ClassMember], methods: bool) -> Vec<&ClassMember> {
    let mut visible: Vec<&ClassMember> = members
        .iter()
        .filter(|member| is_abi_visible(member.access_flags))
        .filter(|member| !(methods && member.name == "<clinit>"))
        .collect();
    visible.sort_by(|a, b| (&a.name, &a.descriptor).cmp(&(&b.name, &b.descriptor)));
    visible
}

fn put_member_header(hasher: &mut Hasher, member: &ClassMember) {
    hasher.put_str(&member.name);
    hasher.put_str(&member.descriptor);
    hasher.put_u64(u64::from(member.access_flags));
}

fn put_constant<'a>(hasher: &'a mut Hasher, value: &ConstValue) -> &'a mut Hasher {
    match value {
        ConstValue::Int(v) => hasher.put_str("I").put_i64(i64::from(*v)),
        ConstValue::Float(bits) => hasher.put_str("F").put_u64(u64::from(*bits)),
        ConstValue::Long(v) => hasher.put_str("J").put_i64(*v),
        ConstValue::Double(bits) => hasher.put_str("D").put_u64(*bits),
        ConstValue::String(text) => hasher.put_str("S").put_str(text),
    }
}
