//! Boundary-level binary class-file reader. Decodes a `.class` file into a
//! flat structural record with no semantic interpretation (no constant-pool
//! resolution, no descriptor parsing) -- that is `classloader.rs`'s job.

use std::{
    error::Error,
    fs::File,
    io::{BufReader, Cursor, Read},
};

use byteorder::{BigEndian, ReadBytesExt};

#[derive(Debug)]
pub struct ClassFile {
    pub magic: u32,
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: Vec<CpInfo>,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone)]
pub enum CpInfo {
    Class { name_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    String { string_index: u16 },
    Integer { bytes: u32 },
    Float { bytes: u32 },
    Long { high_bytes: u32, low_bytes: u32 },
    Double { high_bytes: u32, low_bytes: u32 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    Utf8 { bytes: Vec<u8> },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
}

#[derive(Debug)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug)]
pub struct AttributeInfo {
    pub attribute_name_index: u16,
    pub info: Vec<u8>,
}

fn read_cp_info(rdr: &mut Cursor<Vec<u8>>) -> Result<CpInfo, Box<dyn Error>> {
    let tag = rdr.read_u8()?;
    Ok(match tag {
        1 => {
            let length = rdr.read_u16::<BigEndian>()?;
            let mut buf = vec![0u8; length as usize];
            rdr.read_exact(&mut buf)?;
            CpInfo::Utf8 { bytes: buf }
        }
        3 => CpInfo::Integer { bytes: rdr.read_u32::<BigEndian>()? },
        4 => CpInfo::Float { bytes: rdr.read_u32::<BigEndian>()? },
        5 => CpInfo::Long {
            high_bytes: rdr.read_u32::<BigEndian>()?,
            low_bytes: rdr.read_u32::<BigEndian>()?,
        },
        6 => CpInfo::Double {
            high_bytes: rdr.read_u32::<BigEndian>()?,
            low_bytes: rdr.read_u32::<BigEndian>()?,
        },
        7 => CpInfo::Class { name_index: rdr.read_u16::<BigEndian>()? },
        8 => CpInfo::String { string_index: rdr.read_u16::<BigEndian>()? },
        9 => CpInfo::Fieldref {
            class_index: rdr.read_u16::<BigEndian>()?,
            name_and_type_index: rdr.read_u16::<BigEndian>()?,
        },
        10 => CpInfo::Methodref {
            class_index: rdr.read_u16::<BigEndian>()?,
            name_and_type_index: rdr.read_u16::<BigEndian>()?,
        },
        11 => CpInfo::InterfaceMethodref {
            class_index: rdr.read_u16::<BigEndian>()?,
            name_and_type_index: rdr.read_u16::<BigEndian>()?,
        },
        12 => CpInfo::NameAndType {
            name_index: rdr.read_u16::<BigEndian>()?,
            descriptor_index: rdr.read_u16::<BigEndian>()?,
        },
        15 => CpInfo::MethodHandle {
            reference_kind: rdr.read_u8()?,
            reference_index: rdr.read_u16::<BigEndian>()?,
        },
        16 => CpInfo::MethodType { descriptor_index: rdr.read_u16::<BigEndian>()? },
        18 => CpInfo::InvokeDynamic {
            bootstrap_method_attr_index: rdr.read_u16::<BigEndian>()?,
            name_and_type_index: rdr.read_u16::<BigEndian>()?,
        },
        other => return Err(format!("unknown constant pool tag {other}").into()),
    })
}

/// Long and Double entries occupy two constant-pool slots; the second slot
/// is unusable and must be skipped by callers indexing the pool.
pub fn cp_entry_width(entry: &CpInfo) -> u16 {
    matches!(entry, CpInfo::Long { .. } | CpInfo::Double { .. })
        .then_some(2)
        .unwrap_or(1)
}

fn read_attributes(
    rdr: &mut Cursor<Vec<u8>>,
    count: u16,
) -> Result<Vec<AttributeInfo>, Box<dyn Error>> {
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let attribute_name_index = rdr.read_u16::<BigEndian>()?;
        let attribute_length = rdr.read_u32::<BigEndian>()?;
        let mut info = vec![0u8; attribute_length as usize];
        rdr.read_exact(&mut info)?;
        attributes.push(AttributeInfo { attribute_name_index, info });
    }
    Ok(attributes)
}

pub fn read_class_file(path: &str) -> Result<ClassFile, Box<dyn Error>> {
    let mut buffer = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut buffer)?;
    read_class_bytes(buffer)
}

pub fn read_class_bytes(buffer: Vec<u8>) -> Result<ClassFile, Box<dyn Error>> {
    let mut rdr = Cursor::new(buffer);

    let magic = rdr.read_u32::<BigEndian>()?;
    if magic != 0xcafebabe {
        return Err("not a class file: bad magic".into());
    }

    let minor_version = rdr.read_u16::<BigEndian>()?;
    let major_version = rdr.read_u16::<BigEndian>()?;
    if major_version > 55 {
        return Err(format!("unsupported class file version {major_version}").into());
    }

    let constant_pool_count = rdr.read_u16::<BigEndian>()?;
    let mut constant_pool = Vec::new();
    let mut slot = 1;
    while slot < constant_pool_count {
        let entry = read_cp_info(&mut rdr)?;
        let width = cp_entry_width(&entry);
        constant_pool.push(entry);
        // Long/Double occupy a phantom extra slot; fill it so index math
        // (constant-pool index - 1 == vec index) stays valid.
        if width == 2 {
            constant_pool.push(CpInfo::Utf8 { bytes: vec![] });
        }
        slot += width;
    }

    let access_flags = rdr.read_u16::<BigEndian>()?;
    let this_class = rdr.read_u16::<BigEndian>()?;
    let super_class = rdr.read_u16::<BigEndian>()?;

    let interfaces_count = rdr.read_u16::<BigEndian>()?;
    let mut interfaces = Vec::with_capacity(interfaces_count as usize);
    for _ in 0..interfaces_count {
        interfaces.push(rdr.read_u16::<BigEndian>()?);
    }

    let fields_count = rdr.read_u16::<BigEndian>()?;
    let mut fields = Vec::with_capacity(fields_count as usize);
    for _ in 0..fields_count {
        let access_flags = rdr.read_u16::<BigEndian>()?;
        let name_index = rdr.read_u16::<BigEndian>()?;
        let descriptor_index = rdr.read_u16::<BigEndian>()?;
        let attributes_count = rdr.read_u16::<BigEndian>()?;
        let attributes = read_attributes(&mut rdr, attributes_count)?;
        fields.push(FieldInfo { access_flags, name_index, descriptor_index, attributes });
    }

    let methods_count = rdr.read_u16::<BigEndian>()?;
    let mut methods = Vec::with_capacity(methods_count as usize);
    for _ in 0..methods_count {
        let access_flags = rdr.read_u16::<BigEndian>()?;
        let name_index = rdr.read_u16::<BigEndian>()?;
        let descriptor_index = rdr.read_u16::<BigEndian>()?;
        let attributes_count = rdr.read_u16::<BigEndian>()?;
        let attributes = read_attributes(&mut rdr, attributes_count)?;
        methods.push(MethodInfo { access_flags, name_index, descriptor_index, attributes });
    }

    let attributes_count = rdr.read_u16::<BigEndian>()?;
    let attributes = read_attributes(&mut rdr, attributes_count)?;

    Ok(ClassFile {
        magic,
        minor_version,
        major_version,
        constant_pool,
        access_flags,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let err = read_class_bytes(vec![0, 0, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn rejects_future_major_version() {
        let mut bytes = vec![0xca, 0xfe, 0xba, 0xbe, 0x00, 0x00, 0x00, 99, 0x00, 0x01];
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let err = read_class_bytes(bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }
}
